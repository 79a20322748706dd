use machine_learning::{MlErr, variables::VariableStore};
use ndarray::{Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The layers exported as forward parameters, in order.
pub const FORWARD_BLOCKS: [&str; 4] = ["hidden_1", "hidden_2", "output_1", "output_2"];

/// A `[weights; biases]` block of the autoencoder, exported for reuse outside the trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardParameter {
    pub block: String,
    pub weights: String,
    pub biases: String,
}

impl ForwardParameter {
    /// Stacks the weights of the block over its bias row.
    ///
    /// # Returns
    /// A `[inputs + 1, outputs]` matrix or an error if the variables are missing or their
    /// shapes don't line up.
    pub fn matrix(&self, store: &VariableStore) -> Result<Array2<f32>> {
        let weights = store.get(&self.weights)?.view2()?;
        let biases = store.get(&self.biases)?.view1()?;

        if biases.len() != weights.ncols() {
            return Err(MlErr::ShapeMismatch {
                name: self.biases.clone(),
                got: vec![biases.len()],
                expected: vec![weights.ncols()],
            }
            .into());
        }

        let row = biases.insert_axis(Axis(0));
        concatenate(Axis(0), &[weights, row])
            .map_err(|e| TrainErr::Contract(format!("forward parameter {}: {e}", self.block)))
    }

    pub fn width(&self, store: &VariableStore) -> Result<usize> {
        Ok(store.get(&self.biases)?.len())
    }
}

/// Finds the single trainable variable whose name contains both `block` and `kind`.
fn find_one(store: &VariableStore, block: &'static str, kind: &'static str) -> Result<String> {
    match store.find_trainable(&[block, kind]).as_slice() {
        [var] => Ok(var.name().to_string()),
        matches => Err(MlErr::ForwardParameter {
            layer: block,
            kind,
            matches: matches.len(),
        }
        .into()),
    }
}

/// Extracts the four forward parameter blocks by name.
///
/// # Arguments
/// * `store` - The variables of the model.
/// * `vocab_size` - The width the last block must have.
///
/// # Returns
/// The blocks or an error if a role matches zero or many variables, or the last block isn't
/// as wide as the label vocabulary.
pub fn forward_parameters(store: &VariableStore, vocab_size: usize) -> Result<Vec<ForwardParameter>> {
    let params = FORWARD_BLOCKS
        .iter()
        .map(|&block| {
            Ok(ForwardParameter {
                block: block.to_string(),
                weights: find_one(store, block, "weights")?,
                biases: find_one(store, block, "biases")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    check_forward_parameters(&params, store, vocab_size)?;
    Ok(params)
}

/// Checks that previously extracted blocks still describe `store`.
pub fn check_forward_parameters(
    params: &[ForwardParameter],
    store: &VariableStore,
    vocab_size: usize,
) -> Result<()> {
    if params.len() != FORWARD_BLOCKS.len() {
        return Err(TrainErr::MissingHandle(format!(
            "parameters ({} of {} blocks)",
            params.len(),
            FORWARD_BLOCKS.len()
        )));
    }

    for param in params {
        param.matrix(store)?;
    }

    let last = &params[FORWARD_BLOCKS.len() - 1];
    let width = last.width(store)?;
    if width != vocab_size {
        return Err(TrainErr::Contract(format!(
            "the {} block is {width} wide but the label vocabulary has {vocab_size} classes",
            last.block
        )));
    }

    Ok(())
}
