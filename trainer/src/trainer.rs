//! The training loop of a master or worker task.

use std::{path::PathBuf, time::Instant};

use comms::specs::cluster::{ClusterSpec, TaskSpec};
use log::{info, warn};
use machine_learning::{optimization::OptimizerState, registry::Catalog, variables::VariableStore};

use crate::{
    Result, TrainingConfig,
    checkpoint::{self, StartState},
    coordinator::{DevicePlacement, Server, start_server},
    export::export_parameters,
    graph::{GraphBuilder, GraphHandles, MetaGraph},
    session::{LocalSession, RemoteSession, Session},
    summary::TrainingMetrics,
    supervisor::{StopSignal, Supervisor},
};

/// What a finished run did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// The steps run by this task.
    pub steps: u64,
    /// The steps whose metrics were written to the monitoring stream.
    pub metric_events: usize,
    pub global_step: u64,
    /// The forward parameter files, only written by the master.
    pub exported: Vec<PathBuf>,
    pub checkpoint: Option<PathBuf>,
}

/// A graph ready to train, either freshly built or recovered from a checkpoint.
struct Prepared {
    handles: GraphHandles,
    variables: VariableStore,
    meta: MetaGraph,
    global_step: u64,
    optimizers: Option<Vec<OptimizerState>>,
}

/// Runs the training loop of one task until the input is exhausted or a stop is requested.
pub struct Trainer {
    cluster: Option<ClusterSpec>,
    task: TaskSpec,
    config: TrainingConfig,
    catalog: Catalog,
    stop: StopSignal,
}

impl Trainer {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `cluster` - The cluster of the run, `None` trains locally.
    /// * `task` - This task.
    /// * `config` - The flags of the run.
    /// * `catalog` - The registry the model, the loss and the optimizer are resolved from.
    pub fn new(
        cluster: Option<ClusterSpec>,
        task: TaskSpec,
        config: TrainingConfig,
        catalog: Catalog,
    ) -> Self {
        Self {
            cluster,
            task,
            config,
            catalog,
            stop: StopSignal::new(),
        }
    }

    /// Returns a handle that ends the loop after the current step.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Prepares the graph, connects the session and runs the loop.
    ///
    /// # Returns
    /// The report of the run, or the first configuration, input, network or contract error.
    /// Running out of input is a normal completion.
    pub fn run(self) -> Result<TrainingReport> {
        let task = self.task;
        let is_master = task.is_master();
        let train_dir = PathBuf::from(&self.config.train_dir);

        info!("{task}: version {}", env!("CARGO_PKG_VERSION"));

        if is_master && self.config.start_new_model {
            checkpoint::remove_training_directory(&task, &train_dir);
        }

        // Held until the run ends, claiming this task's address in the cluster.
        let _task_address = self.start_server()?;
        let prepared = self.prepare()?;

        let Prepared {
            mut handles,
            variables,
            meta,
            global_step,
            optimizers,
        } = prepared;

        let mut session = self.session(variables, &meta, global_step, optimizers)?;
        let mut supervisor = Supervisor::new(task, session.is_chief(), &self.config, self.stop.clone())?;

        info!("{task}: Starting managed session.");
        let outcome = Self::train(&task, &mut handles, session.as_mut(), &mut supervisor, &meta);

        let report = outcome.and_then(|(steps, metric_events)| {
            session.pull()?;

            let exported = if is_master {
                export_parameters(&train_dir, &handles.parameters, session.variables())?
            } else {
                Vec::new()
            };

            Ok(TrainingReport {
                steps,
                metric_events,
                global_step: session.global_step(),
                exported,
                checkpoint: supervisor.finish(session.as_mut(), &meta)?,
            })
        });

        if let Err(e) = session.close() {
            warn!("{task}: couldn't close the session: {e}");
        }

        info!("{task}: Exited training loop.");
        report
    }

    /// Binds this task's address when running inside a cluster.
    fn start_server(&self) -> Result<Option<Server>> {
        let Some(cluster) = &self.cluster else {
            return Ok(None);
        };

        info!(
            "{}: Starting trainer within cluster {}",
            self.task,
            serde_json::to_string(cluster)?
        );

        start_server(cluster, &self.task).map(Some)
    }

    /// Recovers the latest checkpoint or builds a new graph.
    fn prepare(&self) -> Result<Prepared> {
        let task = self.task;
        let train_dir = PathBuf::from(&self.config.train_dir);

        match checkpoint::start_state(&train_dir, self.config.start_new_model) {
            StartState::Recover { checkpoint, meta } => {
                info!("{task}: Restoring from meta graph file {}", meta.display());

                let data = checkpoint::restore(&checkpoint)?;
                let meta = MetaGraph::read(&meta)?;
                let handles = meta.recover(&self.catalog, &data.variables)?;

                info!(global_step = data.global_step; "{task}: Recovered graph.");
                Ok(Prepared {
                    handles,
                    variables: data.variables,
                    meta,
                    global_step: data.global_step,
                    optimizers: data.optimizers,
                })
            }
            StartState::Fresh(reason) => {
                info!("{task}: {reason}");

                let built = GraphBuilder::new(&self.catalog, &self.config).build()?;

                info!("{task}: Built graph.");
                Ok(Prepared {
                    handles: built.handles,
                    variables: built.variables,
                    meta: built.meta,
                    global_step: 0,
                    optimizers: None,
                })
            }
        }
    }

    /// Creates the in process session, or the parameter server session inside a cluster.
    fn session(
        &self,
        variables: VariableStore,
        meta: &MetaGraph,
        global_step: u64,
        optimizers: Option<Vec<OptimizerState>>,
    ) -> Result<Box<dyn Session>> {
        if let Some(cluster) = &self.cluster {
            let placement = DevicePlacement::new(cluster, &self.task, &variables)?;
            if self.config.log_device_placement {
                placement.log();
            }

            let session = RemoteSession::connect(
                &placement,
                variables,
                meta.optimizer.clone(),
                global_step,
                self.task.is_master(),
            )?;

            return Ok(Box::new(session));
        }

        let lens: Vec<usize> = variables.trainable().map(|v| v.len()).collect();
        let mut session = LocalSession::new(
            variables,
            self.catalog.optimizers(&meta.optimizer, &lens)?,
            global_step,
        )?;

        if let Some(states) = optimizers {
            session.restore_optimizers(states)?;
        }

        Ok(Box::new(session))
    }

    /// Runs steps until the supervisor says stop.
    ///
    /// # Returns
    /// The amount of steps run and of metric events written.
    fn train(
        task: &TaskSpec,
        handles: &mut GraphHandles,
        session: &mut dyn Session,
        supervisor: &mut Supervisor,
        meta: &MetaGraph,
    ) -> Result<(u64, usize)> {
        let mut steps = 0;
        let mut metric_events = 0;

        info!("{task}: Entering training loop.");
        while !supervisor.should_stop() {
            let start = Instant::now();
            let Some(out) = handles.train_op.run_step(session, &mut handles.input)? else {
                info!("{task}: Done training -- epoch limit reached.");
                supervisor.mark_exhausted();
                break;
            };

            let elapsed = start.elapsed();
            steps += 1;

            if task.is_master() {
                let metrics = TrainingMetrics::new(
                    out.predictions.view(),
                    out.labels.view(),
                    out.examples,
                    elapsed,
                );

                info!(
                    "{task}: training step {}| Hit@1: {:.2} PERR: {:.2} GAP: {:.2} Loss: {} RegLoss: {}",
                    out.global_step,
                    metrics.hit_at_one,
                    metrics.perr,
                    metrics.gap,
                    out.loss.total,
                    out.loss.regularization,
                );

                if supervisor.record_metrics(out.global_step, &metrics)? {
                    metric_events += 1;
                }
            }

            supervisor.after_step(session, meta, &out)?;
        }

        if !supervisor.is_exhausted() {
            info!("{task}: stop requested after {steps} steps");
        }

        Ok((steps, metric_events))
    }
}
