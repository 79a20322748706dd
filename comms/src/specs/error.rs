use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used for cluster and task specifications.
pub type Result<T> = std::result::Result<T, SpecErr>;

/// Errors raised while interpreting the cluster environment.
#[derive(Debug, PartialEq, Eq)]
pub enum SpecErr {
    MissingTaskType,
    MissingTaskIndex,
    InvalidTaskType(String),
    SecondMaster { index: usize },
    TooManyMasters { got: usize },
    UnknownJob(String),
    TaskIndexOutOfRange { job: String, index: usize, len: usize },
    Malformed(String),
}

impl Display for SpecErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecErr::MissingTaskType => write!(f, "The task type must be specified"),
            SpecErr::MissingTaskIndex => write!(f, "The task index must be specified"),
            SpecErr::InvalidTaskType(kind) => write!(f, "Invalid task_type: {kind}"),
            SpecErr::SecondMaster { index } => write!(
                f,
                "/job:master/task:{index}: Only one replica of master expected"
            ),
            SpecErr::TooManyMasters { got } => write!(
                f,
                "The cluster declares {got} master addresses, only one replica of master expected"
            ),
            SpecErr::UnknownJob(job) => write!(f, "The cluster has no job named '{job}'"),
            SpecErr::TaskIndexOutOfRange { job, index, len } => write!(
                f,
                "Task index {index} is out of range for job '{job}' with {len} tasks"
            ),
            SpecErr::Malformed(detail) => write!(f, "Malformed cluster configuration: {detail}"),
        }
    }
}

impl Error for SpecErr {}
