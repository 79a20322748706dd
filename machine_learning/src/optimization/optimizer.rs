use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// The serializable slots of an optimizer, written along the variables on every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub slots: Vec<Vec<f32>>,
    pub powers: Vec<f32>,
}

/// Defines the strategy for updating a variable based on its gradient.
pub trait Optimizer: Send {
    /// Updates `params` in place.
    ///
    /// # Arguments
    /// * `learning_rate` - The decayed learning rate of the current step.
    /// * `grad` - The gradient of the variable.
    /// * `params` - The values to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad`, `params` and the inner slots.
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// Returns a snapshot of the optimizer slots.
    fn state(&self) -> OptimizerState;

    /// Replaces the optimizer slots with a previously taken snapshot.
    fn restore(&mut self, state: OptimizerState) -> Result<()>;
}

/// Checks that `grad`, `params` and every slot share the same length.
pub(super) fn check_sizes(grad: &[f32], params: &[f32], slots: &[&[f32]]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(MlErr::SizeMismatch {
            a: "gradient",
            b: "parameters",
            got: grad.len(),
            expected: params.len(),
        });
    }

    if let Some(slot) = slots.iter().find(|s| s.len() != params.len()) {
        return Err(MlErr::SizeMismatch {
            a: "optimizer slot",
            b: "parameters",
            got: slot.len(),
            expected: params.len(),
        });
    }

    Ok(())
}

/// Validates the shape of a snapshot before restoring it.
pub(super) fn check_state(
    optimizer: &'static str,
    state: &OptimizerState,
    slots: usize,
    powers: usize,
    len: usize,
) -> Result<()> {
    let invalid = |reason: String| MlErr::InvalidOptimizerState { optimizer, reason };

    if state.slots.len() != slots || state.powers.len() != powers {
        return Err(invalid(format!(
            "expected {slots} slots and {powers} powers, got {} and {}",
            state.slots.len(),
            state.powers.len()
        )));
    }

    match state.slots.iter().find(|s| s.len() != len) {
        Some(slot) => Err(invalid(format!(
            "slot of length {} for a variable of length {len}",
            slot.len()
        ))),
        None => Ok(()),
    }
}
