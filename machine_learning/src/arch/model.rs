use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{ModelInput, ModelOutput, OutputGrad};
use crate::{
    Result,
    variables::{Gradients, Variable, VariableStore},
};

/// The size hyper-parameters every registered model is built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub vocab_size: usize,
    pub hidden_size_1: usize,
    pub hidden_size_2: usize,
}

/// A pluggable model, resolved by name through the component registry.
///
/// The model owns no parameters, every tensor it reads lives in the `VariableStore`
/// so that sessions can place, pull and checkpoint them.
pub trait Model: Send {
    /// Creates the initial values of every variable of the model.
    ///
    /// # Arguments
    /// * `rng` - The random number generator used for initialization.
    ///
    /// # Returns
    /// The variables or an error if the hyper-parameters are invalid.
    fn create_variables(&self, rng: &mut StdRng) -> Result<Vec<Variable>>;

    /// Runs the model over a batch.
    ///
    /// # Arguments
    /// * `vars` - The current value of the variables.
    /// * `input` - The batch.
    ///
    /// # Returns
    /// The result bundle or an error if a variable is missing or malformed.
    fn forward(&mut self, vars: &VariableStore, input: &ModelInput<'_>) -> Result<ModelOutput>;

    /// Computes the gradient of the total loss with respect to the trainable variables.
    ///
    /// Must be called after `forward`. Besides the gradient flowing from the label loss the
    /// model adds the gradients of the terms it contributed itself (`loss`, `loss_sparse`
    /// and `regularization_loss`, the latter scaled by `grad.regularization_penalty`).
    ///
    /// # Arguments
    /// * `vars` - The same variables `forward` saw.
    /// * `grad` - The gradient with respect to the outputs.
    fn backward(&mut self, vars: &VariableStore, grad: &OutputGrad) -> Result<Gradients>;
}
