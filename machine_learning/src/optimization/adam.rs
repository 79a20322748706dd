use super::{Optimizer, OptimizerState, optimizer};
use crate::Result;

#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        optimizer::check_sizes(grad, params, &[&self.v, &self.s])?;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = learning_rate * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            slots: vec![self.v.to_vec(), self.s.to_vec()],
            powers: vec![self.beta1_t, self.beta2_t],
        }
    }

    fn restore(&mut self, state: OptimizerState) -> Result<()> {
        optimizer::check_state("AdamOptimizer", &state, 2, 2, self.v.len())?;

        let OptimizerState { slots, powers } = state;
        let mut slots = slots.into_iter().map(Vec::into_boxed_slice);
        if let (Some(v), Some(s)) = (slots.next(), slots.next()) {
            self.v = v;
            self.s = s;
        }

        self.beta1_t = powers[0];
        self.beta2_t = powers[1];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_the_learning_rate() {
        let mut adam = Adam::new(2, 0.9, 0.999, 1e-8);
        let mut params = [1., -1.];
        adam.update_params(0.01, &[0.5, -3.], &mut params).unwrap();

        assert!((params[0] - 0.99).abs() < 1e-4);
        assert!((params[1] + 0.99).abs() < 1e-4);
    }

    #[test]
    fn state_survives_a_restore() {
        let mut adam = Adam::new(3, 0.9, 0.999, 1e-8);
        let mut params = [0.; 3];
        adam.update_params(0.1, &[1., 2., 3.], &mut params).unwrap();

        let mut restored = Adam::new(3, 0.9, 0.999, 1e-8);
        restored.restore(adam.state()).unwrap();
        assert_eq!(restored.state(), adam.state());

        let bad = OptimizerState {
            slots: vec![vec![0.; 2], vec![0.; 2]],
            powers: vec![1., 1.],
        };
        assert!(restored.restore(bad).is_err());
    }

    #[test]
    fn mismatched_gradients_are_rejected() {
        let mut adam = Adam::new(2, 0.9, 0.999, 1e-8);
        assert!(adam.update_params(0.1, &[1.], &mut [0., 0.]).is_err());
    }
}
