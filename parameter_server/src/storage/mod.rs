mod error;
mod handle;
mod shard;

pub use error::{Result, ShardErr};
pub use handle::ShardHandle;
pub(super) use shard::ParameterShard;
