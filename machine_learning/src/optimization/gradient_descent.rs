use super::{Optimizer, OptimizerState, optimizer};
use crate::Result;

/// Gradient descent optimization algorithm.
#[derive(Debug, Default, Clone, Copy)]
pub struct GradientDescent;

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for GradientDescent {
    /// Updates the parameters according to the algorithm's learning rule, that is, making a step in
    /// the opposite direction of the gradient, with a length of `learning_rate`.
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        optimizer::check_sizes(grad, params, &[])?;

        for (w, g) in params.iter_mut().zip(grad) {
            *w -= learning_rate * g;
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState::default()
    }

    fn restore(&mut self, state: OptimizerState) -> Result<()> {
        optimizer::check_state("GradientDescentOptimizer", &state, 0, 0, 0)
    }
}
