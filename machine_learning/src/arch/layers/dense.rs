use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, linalg};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{
    MlErr, Result,
    arch::Activation,
    variables::{Variable, VariableStore},
};

/// A fully connected layer whose weights and biases live in a `VariableStore` under
/// `<scope>/<name>/weights` and `<scope>/<name>/biases`.
#[derive(Debug, Clone)]
pub struct Dense {
    name: &'static str,
    dim: (usize, usize),
    activation: Option<Activation>,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
    a: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `name` - The name of the layer inside the model scope.
    /// * `dim` - The amount of inputs and outputs.
    /// * `activation` - An optional activation function.
    pub fn new(name: &'static str, dim: (usize, usize), activation: Option<Activation>) -> Self {
        let zeros = Array2::zeros((0, 0));

        Self {
            name,
            dim,
            activation,
            x: zeros.clone(),
            z: zeros.clone(),
            a: zeros,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn weights_name(&self, scope: &str) -> String {
        format!("{scope}/{}/weights", self.name)
    }

    pub fn biases_name(&self, scope: &str) -> String {
        format!("{scope}/{}/biases", self.name)
    }

    /// Creates the variables of this layer, Xavier uniform weights and zero biases.
    ///
    /// # Arguments
    /// * `scope` - The model scope prefixing the variable names.
    /// * `weight_decay` - The L2 weight decay of the weights.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// The weights and biases or an error if the layer has a zero dimension.
    pub fn variables<R: Rng>(
        &self,
        scope: &str,
        weight_decay: f32,
        rng: &mut R,
    ) -> Result<[Variable; 2]> {
        let (fan_in, fan_out) = self.dim;
        let limit = (6. / (fan_in + fan_out) as f32).sqrt();
        let dist = Uniform::new(-limit, limit).map_err(|e| MlErr::InvalidHyperParameter {
            name: "layer dimensions",
            reason: format!("{} with {:?}: {e}", self.name, self.dim),
        })?;

        let weights = dist.sample_iter(rng).take(fan_in * fan_out).collect();
        let weights = Variable::new(self.weights_name(scope), vec![fan_in, fan_out], weights, true)?
            .with_weight_decay(weight_decay);
        let biases = Variable::zeros(self.biases_name(scope), vec![fan_out], true);

        Ok([weights, biases])
    }

    /// Fetches the weights and biases of this layer from `vars`.
    pub fn params<'a>(
        &self,
        scope: &str,
        vars: &'a VariableStore,
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let w = vars.get(&self.weights_name(scope))?.view2()?;
        let b = vars.get(&self.biases_name(scope))?.view1()?;

        if w.dim() != self.dim || b.len() != self.dim.1 {
            return Err(MlErr::ShapeMismatch {
                name: self.weights_name(scope),
                got: vec![w.nrows(), w.ncols()],
                expected: vec![self.dim.0, self.dim.1],
            });
        }

        Ok((w, b))
    }

    /// Runs the layer over a batch, keeping what the backward pass needs.
    ///
    /// # Arguments
    /// * `w` - The weights.
    /// * `b` - The biases.
    /// * `x` - The input batch of shape `[batch, inputs]`.
    ///
    /// # Returns
    /// The activations of shape `[batch, outputs]`.
    pub fn forward(
        &mut self,
        w: ArrayView2<f32>,
        b: ArrayView1<f32>,
        x: ArrayView2<f32>,
    ) -> ArrayView2<'_, f32> {
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        self.x = x.to_owned();
        self.z = z;

        match self.activation {
            Some(activation) => {
                self.a = activation.apply(self.z.view());
                self.a.view()
            }
            None => self.z.view(),
        }
    }

    /// Backpropagates `d`, the gradient with respect to this layer's output.
    ///
    /// # Arguments
    /// * `w` - The weights used on the last forward pass.
    /// * `d` - The gradient of the loss with respect to the activations.
    ///
    /// # Returns
    /// The weight gradient, the bias gradient and the gradient with respect to the input.
    pub fn backward(
        &self,
        w: ArrayView2<f32>,
        mut d: Array2<f32>,
    ) -> (Array2<f32>, Array1<f32>, Array2<f32>) {
        if let Some(activation) = self.activation {
            activation.backprop(&mut d, self.z.view(), self.a.view());
        }

        let mut dw = Array2::zeros(self.dim);
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        let db = d.sum_axis(Axis(0));

        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        (dw, db, dx)
    }
}
