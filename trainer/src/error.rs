use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use comms::specs::SpecErr;
use machine_learning::MlErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
///
/// Running out of input is not an error, the pipeline reports it as `Ok(None)`.
#[derive(Debug)]
pub enum TrainErr {
    /// Invalid flags or settings, detected before any step runs.
    Config(String),
    Cluster(SpecErr),
    Io(io::Error),
    Serde(serde_json::Error),
    /// The model's result bundle broke the output contract.
    Contract(String),
    /// A handle required for training is neither built nor listed in the meta graph.
    MissingHandle(String),
    Ml(MlErr),
    /// A parameter server answered with an error or an unexpected message.
    Protocol(String),
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Config(detail) => write!(f, "configuration error: {detail}"),
            TrainErr::Cluster(e) => write!(f, "cluster error: {e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Serde(e) => write!(f, "serialization error: {e}"),
            TrainErr::Contract(detail) => write!(f, "model contract violated: {detail}"),
            TrainErr::MissingHandle(name) => write!(f, "required handle {name} is missing"),
            TrainErr::Ml(e) => write!(f, "{e}"),
            TrainErr::Protocol(detail) => write!(f, "protocol error: {detail}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Cluster(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            TrainErr::Serde(e) => Some(e),
            TrainErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<SpecErr> for TrainErr {
    fn from(value: SpecErr) -> Self {
        Self::Cluster(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
