pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod export;
pub mod graph;
pub mod session;
pub mod summary;
pub mod supervisor;
pub mod trainer;

pub use config::TrainingConfig;
pub use coordinator::{Role, dispatch, start_server};
pub use error::{Result, TrainErr};
pub use supervisor::StopSignal;
pub use trainer::{Trainer, TrainingReport};
