mod service;
mod storage;

pub use service::ParameterServer;
pub use storage::{ShardErr, ShardHandle};
