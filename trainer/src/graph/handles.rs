use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::{ForwardParameter, TrainOp};
use crate::{Result, TrainErr, data::InputPipeline};

/// The named entities the training loop and the checkpoints rediscover after a build or a
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handle {
    GlobalStep,
    Loss,
    RegLoss,
    Bottleneck,
    Predictions,
    InputBatchRaw,
    NumFrames,
    Labels,
    TrainOp,
    Parameters,
}

impl Handle {
    pub const ALL: [Handle; 10] = [
        Handle::GlobalStep,
        Handle::Loss,
        Handle::RegLoss,
        Handle::Bottleneck,
        Handle::Predictions,
        Handle::InputBatchRaw,
        Handle::NumFrames,
        Handle::Labels,
        Handle::TrainOp,
        Handle::Parameters,
    ];

    /// The handles read by the training loop and the final export.
    pub const REQUIRED: [Handle; 7] = [
        Handle::GlobalStep,
        Handle::Loss,
        Handle::RegLoss,
        Handle::Predictions,
        Handle::Labels,
        Handle::TrainOp,
        Handle::Parameters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Handle::GlobalStep => "global_step",
            Handle::Loss => "loss",
            Handle::RegLoss => "reg_loss",
            Handle::Bottleneck => "bottleneck",
            Handle::Predictions => "predictions",
            Handle::InputBatchRaw => "input_batch_raw",
            Handle::NumFrames => "num_frames",
            Handle::Labels => "labels",
            Handle::TrainOp => "train_op",
            Handle::Parameters => "parameters",
        }
    }
}

impl FromStr for Handle {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self> {
        Handle::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| TrainErr::MissingHandle(s.to_string()))
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the training loop needs, produced once per run by a fresh build or a recovery.
pub struct GraphHandles {
    pub train_op: TrainOp,
    pub input: InputPipeline,
    pub parameters: Vec<ForwardParameter>,
    registered: BTreeSet<Handle>,
}

impl GraphHandles {
    pub fn new(
        train_op: TrainOp,
        input: InputPipeline,
        parameters: Vec<ForwardParameter>,
        registered: impl IntoIterator<Item = Handle>,
    ) -> Self {
        Self {
            train_op,
            input,
            parameters,
            registered: registered.into_iter().collect(),
        }
    }

    /// Checks that every one of `handles` was registered.
    ///
    /// # Returns
    /// `TrainErr::MissingHandle` naming the first absent handle.
    pub fn require(&self, handles: &[Handle]) -> Result<()> {
        match handles.iter().find(|h| !self.registered.contains(h)) {
            Some(missing) => Err(TrainErr::MissingHandle(missing.to_string())),
            None => Ok(()),
        }
    }
}
