use serde::{Deserialize, Serialize};

/// Hyper-parameters shared by the optimizer family, each implementation reads the ones it uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub momentum: f32,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            momentum: 0.9,
        }
    }
}

/// The specification for an `Optimizer`, resolved by name through the component registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub name: String,
    #[serde(default)]
    pub params: OptimizerParams,
}

impl OptimizerSpec {
    /// Creates a spec with default hyper-parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: OptimizerParams::default(),
        }
    }
}

/// A variable placed on a parameter server shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub len: usize,
}

/// The specification used to initialize a parameter server shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInit {
    pub shard: usize,
    pub variables: Vec<VariableSpec>,
    pub optimizer: OptimizerSpec,
    /// Only the shard that owns the global step receives `Some`.
    pub global_step: Option<u64>,
}

impl ShardInit {
    /// The total amount of floats the shard holds.
    pub fn len(&self) -> usize {
        self.variables.iter().map(|v| v.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The state of a parameter server shard as reported to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard: usize,
    pub initialized: bool,
    pub global_step: Option<u64>,
}
