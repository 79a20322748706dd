//! Decides when the training loop stops and when the chief checkpoints and summarizes.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use comms::specs::cluster::TaskSpec;
use log::{debug, info};
use machine_learning::variables::VariableStore;

use crate::{
    Result, TrainingConfig,
    checkpoint::{CheckpointData, Saver},
    graph::{MetaGraph, StepOutput},
    session::Session,
    summary::{SummaryWriter, TrainingMetrics},
};

/// An external request to stop training, shared between threads.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Fires at most once every `every`, the first call always fires.
#[derive(Debug)]
struct Interval {
    every: Option<Duration>,
    last: Option<Instant>,
}

impl Interval {
    /// `0` seconds disables it.
    fn from_secs(secs: u64) -> Self {
        Self {
            every: (secs > 0).then(|| Duration::from_secs(secs)),
            last: None,
        }
    }

    fn due(&mut self) -> bool {
        let Some(every) = self.every else {
            return false;
        };

        if self.last.is_some_and(|last| last.elapsed() < every) {
            return false;
        }

        self.last = Some(Instant::now());
        true
    }
}

/// Owns the stop predicate of the loop and, on the chief, the checkpoints and the
/// monitoring stream.
pub struct Supervisor {
    task: TaskSpec,
    stop: StopSignal,
    exhausted: bool,
    saver: Saver,
    /// Only the chief writes summaries.
    summaries: Option<SummaryWriter>,
    checkpoints: Interval,
    periodic_summaries: Interval,
    regularization_penalty: f32,
}

impl Supervisor {
    /// Creates a new `Supervisor`.
    ///
    /// # Arguments
    /// * `task` - The task running the loop.
    /// * `is_chief` - Whether this task checkpoints and writes summaries.
    /// * `config` - The flags of the run.
    /// * `stop` - The external stop request.
    pub fn new(task: TaskSpec, is_chief: bool, config: &TrainingConfig, stop: StopSignal) -> Result<Self> {
        let summaries = if is_chief {
            Some(SummaryWriter::create(Path::new(&config.train_dir))?)
        } else {
            None
        };

        Ok(Self {
            task,
            stop,
            exhausted: false,
            saver: Saver::new(&config.train_dir, config.max_to_keep),
            summaries,
            checkpoints: Interval::from_secs(config.save_model_secs),
            periodic_summaries: Interval::from_secs(config.save_summaries_secs),
            regularization_penalty: config.regularization_penalty,
        })
    }

    pub fn is_chief(&self) -> bool {
        self.summaries.is_some()
    }

    pub fn should_stop(&self) -> bool {
        self.exhausted || self.stop.is_requested()
    }

    /// Records that the input ran out, which ends the loop normally.
    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Writes the batch quality of a step and flushes the stream.
    ///
    /// # Returns
    /// Whether the metrics were written, which only the chief does.
    pub fn record_metrics(&mut self, global_step: u64, metrics: &TrainingMetrics) -> Result<bool> {
        let Some(writer) = self.summaries.as_mut() else {
            return Ok(false);
        };

        for (tag, value) in metrics.events() {
            writer.scalar(tag, value, global_step)?;
        }

        writer.flush()?;
        Ok(true)
    }

    /// Runs the periodic summaries and checkpoints that are due after a step.
    pub fn after_step(&mut self, session: &mut dyn Session, meta: &MetaGraph, out: &StepOutput) -> Result<()> {
        if !self.is_chief() {
            return Ok(());
        }

        if self.periodic_summaries.due() {
            session.pull()?;
            self.write_summaries(session.variables(), out)?;
        }

        if self.checkpoints.due() {
            self.save(session, meta)?;
        }

        Ok(())
    }

    /// Writes the final checkpoint of the run.
    ///
    /// # Returns
    /// The checkpoint prefix, `None` on non chief tasks.
    pub fn finish(&mut self, session: &mut dyn Session, meta: &MetaGraph) -> Result<Option<PathBuf>> {
        if !self.is_chief() {
            return Ok(None);
        }

        let prefix = self.save(session, meta)?;
        if let Some(writer) = self.summaries.as_mut() {
            writer.flush()?;
        }

        info!("{}: final checkpoint written", self.task);
        Ok(Some(prefix))
    }

    /// Snapshots the values held after the last update, pulling them from the parameter
    /// servers first.
    fn save(&mut self, session: &mut dyn Session, meta: &MetaGraph) -> Result<PathBuf> {
        session.pull()?;

        let data = CheckpointData {
            global_step: session.global_step(),
            variables: session.variables().clone(),
            optimizers: session.optimizer_state(),
        };

        self.saver.save(&data, meta)
    }

    fn write_summaries(&mut self, vars: &VariableStore, out: &StepOutput) -> Result<()> {
        let Some(writer) = self.summaries.as_mut() else {
            return Ok(());
        };

        let step = out.global_step;
        writer.scalar("learning_rate", out.learning_rate, step)?;
        writer.scalar("label_loss", out.loss.label, step)?;
        if self.regularization_penalty != 0. {
            writer.scalar("reg_loss", out.loss.regularization, step)?;
        }

        let raw: Vec<f32> = out.input_raw.iter().copied().collect();
        writer.histogram("model/input_raw", &raw, step)?;

        for var in vars.iter() {
            writer.histogram(var.name(), var.data(), step)?;
        }

        writer.flush()?;
        debug!(step = step; "summaries written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn stop_requests_cross_threads() {
        let stop = StopSignal::new();
        let remote = stop.clone();

        thread::spawn(move || remote.request_stop()).join().unwrap();
        assert!(stop.is_requested());
    }

    #[test]
    fn intervals_fire_first_then_wait() {
        let mut every = Interval::from_secs(3600);
        assert!(every.due());
        assert!(!every.due());

        let mut never = Interval::from_secs(0);
        assert!(!never.due());
    }

    #[test]
    fn workers_neither_summarize_nor_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            train_dir: dir.path().join("train").to_string_lossy().into_owned(),
            ..Default::default()
        };

        let stop = StopSignal::new();
        let mut sv = Supervisor::new(TaskSpec::default(), false, &config, stop.clone()).unwrap();
        let metrics = TrainingMetrics {
            hit_at_one: 1.,
            perr: 1.,
            gap: 1.,
            examples_per_second: 10.,
        };

        assert!(!sv.record_metrics(1, &metrics).unwrap());
        assert!(!dir.path().join("train").exists());

        assert!(!sv.should_stop());
        stop.request_stop();
        assert!(sv.should_stop());
    }
}
