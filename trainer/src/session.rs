//! Where the variables live during training: in process, or sharded over parameter servers.

use std::time::Duration;

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
    specs::server::{OptimizerSpec, ShardInit, ShardStatus, VariableSpec},
};
use futures::future::try_join_all;
use log::{debug, info};
use machine_learning::{
    arch::UpdateOp,
    optimization::{Optimizer, OptimizerState},
    variables::VariableStore,
};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Runtime,
    time,
};

use crate::{Result, TrainErr, coordinator::DevicePlacement};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

const CONNECT_ATTEMPTS: usize = 50;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// The execution context of the training step.
///
/// A session owns a local copy of every variable. Trainable values are refreshed with `pull`
/// and updated through `apply`, which also advances the global step in the same critical
/// section.
pub trait Session {
    /// Whether this session initializes and checkpoints the variables.
    fn is_chief(&self) -> bool;

    fn variables(&self) -> &VariableStore;

    fn global_step(&self) -> u64;

    /// Refreshes the local copy of the trainable variables.
    fn pull(&mut self) -> Result<()>;

    /// Assigns the values of non trainable variables, completing before it returns.
    fn assign(&mut self, ops: &[UpdateOp]) -> Result<()>;

    /// Applies one gradient per trainable variable.
    ///
    /// # Arguments
    /// * `learning_rate` - The decayed learning rate of this step.
    /// * `grads` - The gradients, aligned with the trainable variables.
    ///
    /// # Returns
    /// The new global step.
    fn apply(&mut self, learning_rate: f32, grads: Vec<Vec<f32>>) -> Result<u64>;

    /// Returns the optimizer slots if this session holds them.
    fn optimizer_state(&self) -> Option<Vec<OptimizerState>>;

    /// Releases the resources of the session.
    fn close(&mut self) -> Result<()>;
}

fn assign_ops(store: &mut VariableStore, ops: &[UpdateOp]) -> Result<()> {
    for op in ops {
        store.get_mut(&op.variable)?.assign(&op.value)?;
    }

    Ok(())
}

/// Trains in process with one optimizer per trainable variable.
pub struct LocalSession {
    store: VariableStore,
    optimizers: Vec<Box<dyn Optimizer>>,
    global_step: u64,
}

impl LocalSession {
    /// Creates a new `LocalSession`.
    ///
    /// # Arguments
    /// * `store` - The initial or restored variables.
    /// * `optimizers` - One optimizer per trainable variable, in order.
    /// * `global_step` - The initial or restored global step.
    ///
    /// # Returns
    /// The session or an error if the optimizers don't match the trainable variables.
    pub fn new(
        store: VariableStore,
        optimizers: Vec<Box<dyn Optimizer>>,
        global_step: u64,
    ) -> Result<Self> {
        let trainable = store.trainable().count();
        if optimizers.len() != trainable {
            return Err(TrainErr::Config(format!(
                "{} optimizers for {trainable} trainable variables",
                optimizers.len()
            )));
        }

        Ok(Self {
            store,
            optimizers,
            global_step,
        })
    }

    /// Restores the optimizer slots of a checkpoint.
    pub fn restore_optimizers(&mut self, states: Vec<OptimizerState>) -> Result<()> {
        if states.len() != self.optimizers.len() {
            return Err(TrainErr::Config(format!(
                "checkpoint holds {} optimizer states for {} variables",
                states.len(),
                self.optimizers.len()
            )));
        }

        for (optimizer, state) in self.optimizers.iter_mut().zip(states) {
            optimizer.restore(state)?;
        }

        Ok(())
    }
}

impl Session for LocalSession {
    fn is_chief(&self) -> bool {
        true
    }

    fn variables(&self) -> &VariableStore {
        &self.store
    }

    fn global_step(&self) -> u64 {
        self.global_step
    }

    fn pull(&mut self) -> Result<()> {
        Ok(())
    }

    fn assign(&mut self, ops: &[UpdateOp]) -> Result<()> {
        assign_ops(&mut self.store, ops)
    }

    fn apply(&mut self, learning_rate: f32, grads: Vec<Vec<f32>>) -> Result<u64> {
        let vars = self.store.trainable_mut();

        for ((var, optimizer), grad) in vars.zip(self.optimizers.iter_mut()).zip(&grads) {
            optimizer.update_params(learning_rate, grad, var.data_mut())?;
        }

        self.global_step += 1;
        Ok(self.global_step)
    }

    fn optimizer_state(&self) -> Option<Vec<OptimizerState>> {
        Some(self.optimizers.iter().map(|o| o.state()).collect())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The connection to a single parameter server shard.
struct ShardConn {
    id: usize,
    rx: NetRx,
    tx: NetTx,
    buf: Vec<u32>,
    /// Trainable indices held by the shard, in order.
    vars: Vec<usize>,
}

impl ShardConn {
    async fn connect(id: usize, addr: &str, vars: Vec<usize>) -> Result<Self> {
        let mut attempt = 0;

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    debug!(shard = id; "ps at {addr} not reachable yet: {e}");
                    attempt += 1;
                    time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        Ok(Self {
            id,
            rx,
            tx,
            buf: Vec::new(),
            vars,
        })
    }

    async fn status(&mut self) -> Result<ShardStatus> {
        self.tx.send(&Msg::Control(Command::Status)).await?;
        self.recv_ready().await
    }

    async fn init(&mut self, init: ShardInit, mut values: Vec<f32>) -> Result<ShardStatus> {
        self.tx.send(&Msg::Control(Command::Init(init))).await?;
        self.tx.send(&Msg::Data(Payload::Params(&mut values))).await?;
        self.recv_ready().await
    }

    async fn recv_ready(&mut self) -> Result<ShardStatus> {
        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Ready(status)) => Ok(status),
            msg => Err(unexpected(self.id, msg)),
        }
    }

    async fn pull(&mut self) -> Result<Vec<f32>> {
        self.tx.send(&Msg::Control(Command::Pull)).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Data(Payload::Params(params)) => Ok(params.to_vec()),
            msg => Err(unexpected(self.id, msg)),
        }
    }

    async fn push(&mut self, learning_rate: f32, grad: Vec<f32>) -> Result<Option<u64>> {
        self.tx
            .send(&Msg::Control(Command::Push { learning_rate }))
            .await?;
        self.tx.send(&Msg::Data(Payload::Gradient(&grad))).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Applied { global_step }) => Ok(global_step),
            msg => Err(unexpected(self.id, msg)),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Disconnect)).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Disconnect) => Ok(()),
            msg => Err(unexpected(self.id, msg)),
        }
    }
}

fn unexpected(shard: usize, msg: Msg) -> TrainErr {
    match msg {
        Msg::Err(detail) => TrainErr::Protocol(format!("ps shard {shard}: {detail}")),
        msg => TrainErr::Protocol(format!(
            "ps shard {shard} answered with an unexpected {} message",
            msg.kind()
        )),
    }
}

/// Trains against parameter servers: variables are pulled before every step and gradients
/// are pushed to the shard that owns them, shard 0 owning the global step.
pub struct RemoteSession {
    runtime: Runtime,
    shards: Vec<ShardConn>,
    store: VariableStore,
    is_chief: bool,
    global_step: u64,
}

impl RemoteSession {
    /// Connects to every parameter server of `placement`.
    ///
    /// The chief initializes each shard with its variables and shard 0 with the global step,
    /// every other task waits until all shards report ready.
    ///
    /// # Arguments
    /// * `placement` - The shard of every trainable variable.
    /// * `store` - The initial or restored variables.
    /// * `optimizer` - The optimizer the shards resolve and apply.
    /// * `global_step` - The initial or restored global step.
    /// * `is_chief` - Whether this task initializes the shards.
    ///
    /// # Returns
    /// The session holding freshly pulled variables, or an error if a shard is unreachable.
    pub fn connect(
        placement: &DevicePlacement,
        store: VariableStore,
        optimizer: OptimizerSpec,
        global_step: u64,
        is_chief: bool,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        let assigned = placement.shards();

        let mut shards = runtime.block_on(async {
            let conns = placement
                .ps_addrs()
                .iter()
                .zip(assigned)
                .enumerate()
                .map(|(id, (addr, vars))| ShardConn::connect(id, addr, vars));

            try_join_all(conns).await
        })?;

        let global_step = if is_chief {
            runtime.block_on(Self::init_shards(&mut shards, &store, optimizer, global_step))?
        } else {
            runtime.block_on(Self::wait_for_shards(&mut shards))?
        };

        info!(shards = shards.len(), global_step = global_step; "connected to parameter servers");

        let mut session = Self {
            runtime,
            shards,
            store,
            is_chief,
            global_step,
        };

        session.pull()?;
        Ok(session)
    }

    async fn init_shards(
        shards: &mut [ShardConn],
        store: &VariableStore,
        optimizer: OptimizerSpec,
        global_step: u64,
    ) -> Result<u64> {
        let trainable: Vec<_> = store.trainable().collect();

        let inits = shards.iter_mut().map(|shard| {
            let mut values = Vec::new();
            let variables = shard
                .vars
                .iter()
                .map(|&i| {
                    let var = trainable[i];
                    values.extend_from_slice(var.data());
                    VariableSpec {
                        name: var.name().to_string(),
                        len: var.len(),
                    }
                })
                .collect();

            let init = ShardInit {
                shard: shard.id,
                variables,
                optimizer: optimizer.clone(),
                global_step: (shard.id == 0).then_some(global_step),
            };

            shard.init(init, values)
        });

        let statuses = try_join_all(inits).await?;
        Ok(owned_step(&statuses).unwrap_or(global_step))
    }

    async fn wait_for_shards(shards: &mut [ShardConn]) -> Result<u64> {
        loop {
            let statuses = try_join_all(shards.iter_mut().map(|s| s.status())).await?;

            if statuses.iter().all(|s| s.initialized) {
                return Ok(owned_step(&statuses).unwrap_or_default());
            }

            debug!("waiting for the chief to initialize the parameter servers");
            time::sleep(RETRY_DELAY).await;
        }
    }
}

fn owned_step(statuses: &[ShardStatus]) -> Option<u64> {
    statuses.iter().find_map(|s| s.global_step)
}

impl Session for RemoteSession {
    fn is_chief(&self) -> bool {
        self.is_chief
    }

    fn variables(&self) -> &VariableStore {
        &self.store
    }

    fn global_step(&self) -> u64 {
        self.global_step
    }

    fn pull(&mut self) -> Result<()> {
        let Self {
            runtime,
            shards,
            store,
            ..
        } = self;

        let pulled = runtime.block_on(try_join_all(shards.iter_mut().map(|s| s.pull())))?;
        let mut trainable: Vec<_> = store.trainable_mut().collect();

        for (shard, values) in shards.iter().zip(pulled) {
            let mut rest = values.as_slice();

            for &i in &shard.vars {
                let var = &mut trainable[i];
                if rest.len() < var.len() {
                    return Err(TrainErr::Protocol(format!(
                        "ps shard {} sent {} floats, fewer than its variables hold",
                        shard.id,
                        values.len()
                    )));
                }

                let (head, tail) = rest.split_at(var.len());
                var.assign(head)?;
                rest = tail;
            }
        }

        Ok(())
    }

    fn assign(&mut self, ops: &[UpdateOp]) -> Result<()> {
        assign_ops(&mut self.store, ops)
    }

    fn apply(&mut self, learning_rate: f32, mut grads: Vec<Vec<f32>>) -> Result<u64> {
        let Self {
            runtime, shards, ..
        } = self;

        let pushes = shards.iter_mut().map(|shard| {
            let grad: Vec<f32> = shard
                .vars
                .iter()
                .flat_map(|&i| std::mem::take(&mut grads[i]))
                .collect();

            shard.push(learning_rate, grad)
        });

        let pushes: Vec<_> = pushes.collect();
        let steps = runtime.block_on(try_join_all(pushes))?;

        self.global_step = match steps.into_iter().flatten().next() {
            Some(step) => step,
            None => self.global_step + 1,
        };

        Ok(self.global_step)
    }

    fn optimizer_state(&self) -> Option<Vec<OptimizerState>> {
        None
    }

    fn close(&mut self) -> Result<()> {
        let Self {
            runtime, shards, ..
        } = self;

        runtime.block_on(try_join_all(shards.iter_mut().map(|s| s.disconnect())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::{optimization::GradientDescent, variables::Variable};

    use super::*;

    #[test]
    fn local_apply_updates_trainable_variables_and_the_step() {
        let store = VariableStore::new(vec![
            Variable::new("w", vec![2], vec![1., 1.], true).unwrap(),
            Variable::new("m", vec![1], vec![5.], false).unwrap(),
        ])
        .unwrap();
        let optimizers: Vec<Box<dyn Optimizer>> = vec![Box::new(GradientDescent::new())];
        let mut session = LocalSession::new(store, optimizers, 3).unwrap();

        let step = session.apply(0.5, vec![vec![1., -1.]]).unwrap();

        assert_eq!(step, 4);
        assert_eq!(session.variables().get("w").unwrap().data(), &[0.5, 1.5]);
        assert_eq!(session.variables().get("m").unwrap().data(), &[5.]);
    }

    #[test]
    fn update_ops_assign_non_trainable_variables() {
        let store = VariableStore::new(vec![Variable::zeros("m", vec![2], false)]).unwrap();
        let mut session = LocalSession::new(store, Vec::new(), 0).unwrap();

        let op = UpdateOp {
            variable: "m".into(),
            value: vec![0.25, 0.75],
        };
        session.assign(&[op]).unwrap();

        assert_eq!(session.variables().get("m").unwrap().data(), &[0.25, 0.75]);
    }

    #[test]
    fn optimizers_must_match_the_trainable_variables() {
        let store = VariableStore::new(vec![Variable::zeros("w", vec![1], true)]).unwrap();
        assert!(LocalSession::new(store, Vec::new(), 0).is_err());
    }
}
