use std::sync::Arc;

use comms::specs::server::{ShardInit, ShardStatus};
use log::info;
use machine_learning::registry::Catalog;
use parking_lot::Mutex;

use super::{ParameterShard, Result, ShardErr};

/// A cloneable handle to the shard of this parameter server, shared by every connection.
#[derive(Clone)]
pub struct ShardHandle {
    id: usize,
    catalog: Arc<Catalog>,
    shard: Arc<Mutex<Option<ParameterShard>>>,
}

impl ShardHandle {
    /// Creates a new uninitialized `ShardHandle`.
    ///
    /// # Arguments
    /// * `id` - The index of this parameter server task.
    /// * `catalog` - The registry used to resolve optimizers.
    pub fn new(id: usize, catalog: Catalog) -> Self {
        Self {
            id,
            catalog: Arc::new(catalog),
            shard: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> ShardStatus {
        match self.shard.lock().as_ref() {
            Some(shard) => shard.status(self.id),
            None => ShardStatus {
                shard: self.id,
                initialized: false,
                global_step: None,
            },
        }
    }

    /// Replaces the contents of the shard, the chief does this once per run.
    pub fn init(&self, init: ShardInit, values: &[f32]) -> Result<ShardStatus> {
        if init.shard != self.id {
            return Err(ShardErr::WrongShard {
                expected: self.id,
                got: init.shard,
            });
        }

        let variables = init.variables.len();
        let shard = ParameterShard::new(&self.catalog, init, values)?;
        info!(shard = self.id, variables = variables, floats = shard.len(); "shard initialized");

        let status = shard.status(self.id);
        *self.shard.lock() = Some(shard);
        Ok(status)
    }

    pub fn pull(&self, out: &mut Vec<f32>) -> Result<()> {
        let guard = self.shard.lock();
        let shard = guard.as_ref().ok_or(ShardErr::NotInitialized)?;
        shard.pull(out);
        Ok(())
    }

    pub fn push(&self, learning_rate: f32, grad: &[f32]) -> Result<Option<u64>> {
        let mut guard = self.shard.lock();
        let shard = guard.as_mut().ok_or(ShardErr::NotInitialized)?;
        shard.push(learning_rate, grad)
    }
}
