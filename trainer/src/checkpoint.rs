//! Checkpoints of the variables, the meta graph snapshots and the start state machine.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
};

use comms::specs::cluster::TaskSpec;
use log::{debug, error, info};
use machine_learning::{optimization::OptimizerState, variables::VariableStore};
use serde::{Deserialize, Serialize};

use crate::{Result, graph::MetaGraph};

/// The name of the pointer file listing the kept checkpoints.
pub const POINTER_FILE: &str = "checkpoint";
const PREFIX: &str = "model.ckpt";
const DATA_EXT: &str = "data";
const META_EXT: &str = "meta";

/// Why a run builds a new graph instead of recovering one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    StartNewModel,
    NoCheckpoint,
    NoMetaGraph,
}

impl Display for FreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreshReason::StartNewModel => {
                write!(f, "Flag 'start_new_model' is set. Building a new model.")
            }
            FreshReason::NoCheckpoint => write!(f, "No checkpoint file found. Building a new model."),
            FreshReason::NoMetaGraph => write!(f, "No meta graph file found. Building a new model."),
        }
    }
}

/// How a run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartState {
    Fresh(FreshReason),
    Recover {
        /// The checkpoint prefix, e.g. `<train_dir>/model.ckpt-120`.
        checkpoint: PathBuf,
        meta: PathBuf,
    },
}

/// Decides whether to build a new graph or recover the latest checkpoint of `train_dir`.
pub fn start_state(train_dir: &Path, start_new_model: bool) -> StartState {
    if start_new_model {
        return StartState::Fresh(FreshReason::StartNewModel);
    }

    let Some(checkpoint) = latest_checkpoint(train_dir) else {
        return StartState::Fresh(FreshReason::NoCheckpoint);
    };

    let meta = with_ext(&checkpoint, META_EXT);
    if !meta.is_file() {
        return StartState::Fresh(FreshReason::NoMetaGraph);
    }

    StartState::Recover { checkpoint, meta }
}

/// Deletes the training directory.
///
/// A missing directory is not an error, any other failure is logged and ignored.
///
/// # Returns
/// Whether the directory is gone.
pub fn remove_training_directory(task: &TaskSpec, train_dir: &Path) -> bool {
    info!("{task}: Removing existing train directory.");

    match fs::remove_dir_all(train_dir) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            error!(
                "{task}: Failed to delete directory {} when starting a new model. Please delete it manually and try again. ({e})",
                train_dir.display()
            );
            false
        }
    }
}

/// The contents of the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
}

impl CheckpointState {
    fn read(train_dir: &Path) -> Option<Self> {
        let json = fs::read_to_string(train_dir.join(POINTER_FILE)).ok()?;
        serde_json::from_str(&json).ok()
    }
}

/// The values written by one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub global_step: u64,
    pub variables: VariableStore,
    /// `None` when the optimizer slots live on parameter servers.
    pub optimizers: Option<Vec<OptimizerState>>,
}

/// Returns the prefix of the newest checkpoint listed in the pointer file of `train_dir`.
pub fn latest_checkpoint(train_dir: &Path) -> Option<PathBuf> {
    let state = CheckpointState::read(train_dir)?;
    if state.model_checkpoint_path.is_empty() {
        return None;
    }

    let prefix = train_dir.join(&state.model_checkpoint_path);
    with_ext(&prefix, DATA_EXT).is_file().then_some(prefix)
}

/// Reads the values of the checkpoint at `prefix`.
pub fn restore(prefix: &Path) -> Result<CheckpointData> {
    let json = fs::read_to_string(with_ext(prefix, DATA_EXT))?;
    Ok(serde_json::from_str(&json)?)
}

/// Appends `.ext` to the checkpoint prefix, which already contains a dot.
fn with_ext(prefix: &Path, ext: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

/// Writes checkpoints to the training directory, keeping only the newest `max_to_keep`.
pub struct Saver {
    train_dir: PathBuf,
    max_to_keep: usize,
    /// Kept checkpoint names, oldest first.
    kept: VecDeque<String>,
}

impl Saver {
    /// Creates a new `Saver`, adopting the checkpoints already listed in `train_dir`.
    ///
    /// # Arguments
    /// * `train_dir` - The training directory.
    /// * `max_to_keep` - The amount of checkpoints kept, `0` keeps all of them.
    pub fn new(train_dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        let train_dir = train_dir.into();
        let kept = CheckpointState::read(&train_dir)
            .map(|s| s.all_model_checkpoint_paths.into())
            .unwrap_or_default();

        Self {
            train_dir,
            max_to_keep,
            kept,
        }
    }

    /// Saves the values and the meta graph of `global_step`.
    ///
    /// # Arguments
    /// * `data` - The values to save.
    /// * `meta` - The graph snapshot written next to them.
    ///
    /// # Returns
    /// The prefix of the new checkpoint.
    pub fn save(&mut self, data: &CheckpointData, meta: &MetaGraph) -> Result<PathBuf> {
        fs::create_dir_all(&self.train_dir)?;

        let name = format!("{PREFIX}-{}", data.global_step);
        let prefix = self.train_dir.join(&name);

        fs::write(with_ext(&prefix, DATA_EXT), serde_json::to_vec(data)?)?;
        meta.write(with_ext(&prefix, META_EXT))?;

        self.kept.retain(|kept| kept != &name);
        self.kept.push_back(name.clone());
        self.cleanup_old();

        let state = CheckpointState {
            model_checkpoint_path: name,
            all_model_checkpoint_paths: self.kept.iter().cloned().collect(),
        };
        fs::write(self.train_dir.join(POINTER_FILE), serde_json::to_vec_pretty(&state)?)?;

        info!(step = data.global_step; "saved checkpoint {}", prefix.display());
        Ok(prefix)
    }

    fn cleanup_old(&mut self) {
        if self.max_to_keep == 0 {
            return;
        }

        while self.kept.len() > self.max_to_keep {
            let Some(old) = self.kept.pop_front() else {
                break;
            };

            let prefix = self.train_dir.join(&old);
            for ext in [DATA_EXT, META_EXT] {
                if let Err(e) = fs::remove_file(with_ext(&prefix, ext))
                    && e.kind() != io::ErrorKind::NotFound
                {
                    debug!("couldn't remove old checkpoint {old}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::variables::Variable;
    use tempfile::tempdir;

    use super::*;

    fn data(step: u64) -> CheckpointData {
        let var = Variable::new("model/w", vec![2], vec![step as f32, -1.], true).unwrap();
        CheckpointData {
            global_step: step,
            variables: VariableStore::new(vec![var]).unwrap(),
            optimizers: Some(vec![OptimizerState::default()]),
        }
    }

    fn meta() -> MetaGraph {
        serde_json::from_value(serde_json::json!({
            "model": "LabelsAutoencoder",
            "model_params": { "vocab_size": 4, "hidden_size_1": 3, "hidden_size_2": 2 },
            "label_loss": "CrossEntropyLoss",
            "optimizer": { "name": "AdamOptimizer" },
            "schedule": {
                "base_learning_rate": 0.01,
                "learning_rate_decay": 0.95,
                "learning_rate_decay_examples": 100,
                "batch_size": 2
            },
            "regularization_penalty": 1.0,
            "clip_gradient_norm": 0.1,
            "input": {
                "data_pattern": "/nonexistent/*.jsonl",
                "features": [["mean_rgb", 2]],
                "frame_features": false,
                "frame_only": false,
                "num_classes": 4,
                "batch_size": 2,
                "num_readers": 1,
                "num_epochs": 1,
                "seed": 1
            },
            "handles": ["global_step", "loss"],
            "parameters": []
        }))
        .unwrap()
    }

    #[test]
    fn the_start_state_follows_the_training_directory() {
        let dir = tempdir().unwrap();

        assert_eq!(
            start_state(dir.path(), true),
            StartState::Fresh(FreshReason::StartNewModel)
        );
        assert_eq!(
            start_state(dir.path(), false),
            StartState::Fresh(FreshReason::NoCheckpoint)
        );

        let prefix = Saver::new(dir.path(), 2).save(&data(7), &meta()).unwrap();
        assert_eq!(
            start_state(dir.path(), false),
            StartState::Recover {
                checkpoint: prefix.clone(),
                meta: with_ext(&prefix, META_EXT),
            }
        );

        fs::remove_file(with_ext(&prefix, META_EXT)).unwrap();
        assert_eq!(
            start_state(dir.path(), false),
            StartState::Fresh(FreshReason::NoMetaGraph)
        );
    }

    #[test]
    fn only_the_newest_checkpoints_are_kept() {
        let dir = tempdir().unwrap();
        let mut saver = Saver::new(dir.path(), 2);

        let first = saver.save(&data(1), &meta()).unwrap();
        saver.save(&data(2), &meta()).unwrap();
        saver.save(&data(2), &meta()).unwrap();
        let last = saver.save(&data(3), &meta()).unwrap();

        assert!(!with_ext(&first, DATA_EXT).exists());
        assert_eq!(latest_checkpoint(dir.path()), Some(last.clone()));

        let state = CheckpointState::read(dir.path()).unwrap();
        assert_eq!(state.all_model_checkpoint_paths, vec!["model.ckpt-2", "model.ckpt-3"]);

        let restored = restore(&last).unwrap();
        assert_eq!(restored, data(3));
    }

    #[test]
    fn removing_a_missing_directory_is_not_an_error() {
        let dir = tempdir().unwrap();
        let train_dir = dir.path().join("train");
        fs::create_dir_all(train_dir.join("nested")).unwrap();

        assert!(remove_training_directory(&TaskSpec::default(), &train_dir));
        assert!(!train_dir.exists());
        assert!(remove_training_directory(&TaskSpec::default(), &train_dir));
    }
}
