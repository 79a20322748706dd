use super::{Optimizer, OptimizerState, optimizer};
use crate::Result;

#[derive(Debug)]
pub struct Momentum {
    momentum: f32,
    velocity: Box<[f32]>,
}

impl Momentum {
    /// Creates a new `Momentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Momentum` instance.
    pub fn new(len: usize, momentum: f32) -> Self {
        Self {
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Momentum {
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        optimizer::check_sizes(grad, params, &[&self.velocity])?;

        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= learning_rate * *v;
            });

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            slots: vec![self.velocity.to_vec()],
            powers: Vec::new(),
        }
    }

    fn restore(&mut self, mut state: OptimizerState) -> Result<()> {
        optimizer::check_state("MomentumOptimizer", &state, 1, 0, self.velocity.len())?;
        self.velocity = state.slots.swap_remove(0).into_boxed_slice();
        Ok(())
    }
}
