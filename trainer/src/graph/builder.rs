use log::info;
use machine_learning::{registry::Catalog, variables::VariableStore};
use rand::{SeedableRng, rngs::StdRng};

use super::{
    GraphHandles, Handle, MetaGraph, ScheduleSettings, TrainOp, params::forward_parameters,
};
use crate::{
    Result, TrainingConfig,
    data::{InputPipeline, InputSettings},
};

/// A freshly built graph.
pub struct BuiltGraph {
    pub handles: GraphHandles,
    pub variables: VariableStore,
    pub meta: MetaGraph,
}

/// Wires the input pipeline, the model, the losses and the optimizer into a `TrainOp`.
pub struct GraphBuilder<'a> {
    catalog: &'a Catalog,
    config: &'a TrainingConfig,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(catalog: &'a Catalog, config: &'a TrainingConfig) -> Self {
        Self { catalog, config }
    }

    /// Builds the graph.
    ///
    /// Every component is resolved before anything else, then the input files are resolved,
    /// then the variables are created and the forward parameters extracted.
    ///
    /// # Returns
    /// The graph or the first configuration, input or contract error found.
    pub fn build(&self) -> Result<BuiltGraph> {
        let config = self.config;
        let model_params = config.model_params();

        let model_factory = self.catalog.model(&config.model)?;
        let loss_fn = self.catalog.loss(&config.label_loss)?();
        let optimizer = config.optimizer_spec();
        self.catalog.optimizer(&optimizer.name)?;

        let schedule_settings = ScheduleSettings {
            base_learning_rate: config.base_learning_rate,
            learning_rate_decay: config.learning_rate_decay,
            learning_rate_decay_examples: config.learning_rate_decay_examples,
            batch_size: config.batch_size as u64,
        };
        let schedule = schedule_settings.schedule()?;

        let input_settings = input_settings(config)?;
        let input = InputPipeline::open(input_settings.clone(), input_settings.reader())?;

        let model = model_factory(model_params);
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let variables = VariableStore::new(model.create_variables(&mut rng)?)?;
        let parameters = forward_parameters(&variables, model_params.vocab_size)?;

        let train_op = TrainOp::new(
            model,
            loss_fn,
            schedule,
            config.regularization_penalty,
            config.clip_gradient_norm,
        );

        let meta = MetaGraph {
            model: config.model.clone(),
            model_params,
            label_loss: config.label_loss.clone(),
            optimizer,
            schedule: schedule_settings,
            regularization_penalty: config.regularization_penalty,
            clip_gradient_norm: config.clip_gradient_norm,
            input: input_settings,
            handles: Handle::ALL.to_vec(),
            parameters: parameters.clone(),
        };

        let handles = GraphHandles::new(train_op, input, parameters, Handle::ALL);
        handles.require(&Handle::REQUIRED)?;

        info!(
            variables = variables.len(),
            trainable_floats = variables.trainable_len();
            "built {} with {}", config.model, config.label_loss
        );

        Ok(BuiltGraph {
            handles,
            variables,
            meta,
        })
    }
}

/// Derives the input pipeline settings from the flags.
pub fn input_settings(config: &TrainingConfig) -> Result<InputSettings> {
    Ok(InputSettings {
        data_pattern: config.train_data_pattern.clone(),
        features: config.features()?,
        frame_features: config.frame_features,
        frame_only: config.frame_only,
        num_classes: config.vocab_size,
        batch_size: config.batch_size,
        num_readers: config.num_readers,
        num_epochs: config.num_epochs,
        seed: config.seed,
    })
}
