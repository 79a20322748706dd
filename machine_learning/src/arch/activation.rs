use ndarray::{Array2, ArrayView2, Zip};

/// The nonlinearities applied after a `Dense` layer's affine transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// The logistic function, used wherever the output is read as a probability.
    Sigmoid,
}

impl Activation {
    /// Applies the activation elementwise to the pre-activations `z`.
    pub fn apply(self, z: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => z.mapv(|z| z.max(0.)),
            Activation::Sigmoid => z.mapv(logistic),
        }
    }

    /// Scales `d`, a gradient with respect to the activations, into one with respect to the
    /// pre-activations.
    ///
    /// # Arguments
    /// * `d` - The upstream gradient, overwritten in place.
    /// * `z` - The pre-activations of the last forward pass.
    /// * `a` - The activations of the last forward pass.
    pub fn backprop(self, d: &mut Array2<f32>, z: ArrayView2<f32>, a: ArrayView2<f32>) {
        match self {
            Activation::Relu => d.zip_mut_with(&z, |d, &z| {
                if z <= 0. {
                    *d = 0.;
                }
            }),
            Activation::Sigmoid => Zip::from(d).and(&a).for_each(|d, &a| *d *= a * (1. - a)),
        }
    }
}

fn logistic(z: f32) -> f32 {
    if z >= 0. {
        1. / (1. + (-z).exp())
    } else {
        let e = z.exp();
        e / (1. + e)
    }
}
