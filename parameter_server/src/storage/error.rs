use std::{
    error::Error,
    fmt::{self, Display},
};

use machine_learning::MlErr;

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, ShardErr>;

/// Errors returned by a `ParameterShard` when a request can't be served.
#[derive(Debug)]
pub enum ShardErr {
    NotInitialized,
    WrongShard { expected: usize, got: usize },
    SizeMismatch { got: usize, expected: usize },
    Ml(MlErr),
}

impl Display for ShardErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardErr::NotInitialized => f.write_str("The shard hasn't been initialized yet"),
            ShardErr::WrongShard { expected, got } => write!(
                f,
                "Received the initialization of shard {got} but this is shard {expected}"
            ),
            ShardErr::SizeMismatch { got, expected } => write!(
                f,
                "The provided buffer has {got} values but the shard holds {expected}"
            ),
            ShardErr::Ml(e) => write!(f, "{e}"),
        }
    }
}

impl Error for ShardErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShardErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for ShardErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}
