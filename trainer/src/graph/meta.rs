use std::{fs, path::Path};

use comms::specs::server::OptimizerSpec;
use machine_learning::{
    arch::ModelParams, registry::Catalog, schedule::ExponentialDecay, variables::VariableStore,
};
use serde::{Deserialize, Serialize};

use super::{ForwardParameter, GraphHandles, Handle, TrainOp, params::check_forward_parameters};
use crate::{
    Result, TrainErr,
    data::{InputPipeline, InputSettings},
};

/// The learning rate schedule flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub base_learning_rate: f32,
    pub learning_rate_decay: f32,
    pub learning_rate_decay_examples: u64,
    pub batch_size: u64,
}

impl ScheduleSettings {
    pub fn schedule(&self) -> Result<ExponentialDecay> {
        let schedule = ExponentialDecay::new(
            self.base_learning_rate,
            self.learning_rate_decay,
            self.learning_rate_decay_examples,
            self.batch_size,
        )?;

        Ok(schedule)
    }
}

/// A snapshot of how the training graph was built, written next to every checkpoint so the
/// graph can be recovered without the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaGraph {
    pub model: String,
    pub model_params: ModelParams,
    pub label_loss: String,
    pub optimizer: OptimizerSpec,
    pub schedule: ScheduleSettings,
    pub regularization_penalty: f32,
    pub clip_gradient_norm: f32,
    pub input: InputSettings,
    pub handles: Vec<Handle>,
    pub parameters: Vec<ForwardParameter>,
}

impl MetaGraph {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Rebuilds the graph handles from this snapshot.
    ///
    /// Components are resolved again by name and the input pipeline is reopened with the
    /// recorded settings.
    ///
    /// # Arguments
    /// * `catalog` - The component registry.
    /// * `variables` - The restored variables.
    ///
    /// # Returns
    /// The handles or an error if a required handle isn't listed, a component can't be
    /// resolved or the variables don't match the recorded forward parameters.
    pub fn recover(&self, catalog: &Catalog, variables: &VariableStore) -> Result<GraphHandles> {
        let missing = Handle::REQUIRED
            .iter()
            .find(|h| !self.handles.contains(h));

        if let Some(handle) = missing {
            return Err(TrainErr::MissingHandle(handle.to_string()));
        }

        let model = catalog.model(&self.model)?(self.model_params);
        let loss_fn = catalog.loss(&self.label_loss)?();
        catalog.optimizer(&self.optimizer.name)?;

        check_forward_parameters(&self.parameters, variables, self.model_params.vocab_size)?;

        let train_op = TrainOp::new(
            model,
            loss_fn,
            self.schedule.schedule()?,
            self.regularization_penalty,
            self.clip_gradient_norm,
        );

        let input = InputPipeline::open(self.input.clone(), self.input.reader())?;

        let handles = GraphHandles::new(
            train_op,
            input,
            self.parameters.clone(),
            self.handles.iter().copied(),
        );

        handles.require(&Handle::REQUIRED)?;
        Ok(handles)
    }
}
