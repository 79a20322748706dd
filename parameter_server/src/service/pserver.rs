use std::io;

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, error, info, warn};
use machine_learning::registry::Catalog;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};

use crate::storage::ShardHandle;

/// The parameter server role, it serves the variables of one shard to every trainer.
pub struct ParameterServer {
    tasks: JoinSet<io::Result<()>>,
    shard: ShardHandle,
}

impl ParameterServer {
    /// Creates a new `ParameterServer`.
    ///
    /// # Arguments
    /// * `shard` - The index of this parameter server inside the `ps` job.
    /// * `catalog` - The registry used to resolve the optimizers trainers ask for.
    pub fn new(shard: usize, catalog: Catalog) -> Self {
        Self {
            tasks: JoinSet::new(),
            shard: ShardHandle::new(shard, catalog),
        }
    }

    #[cfg(test)]
    pub(crate) fn shard(&self) -> &ShardHandle {
        &self.shard
    }

    /// Accepts trainer connections forever, each one is served on its own task.
    ///
    /// # Arguments
    /// * `listener` - The listener bound to this task's address.
    ///
    /// # Returns
    /// Only returns on an accept failure.
    pub async fn serve(mut self, listener: TcpListener) -> io::Result<()> {
        info!(shard = self.shard.id(); "serving parameters");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(shard = self.shard.id(); "trainer connected from {addr}");
                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);
                    self.spawn(rx, tx);
                }
                Some(res) = self.tasks.join_next() => match res {
                    Ok(Ok(())) => debug!("trainer disconnected"),
                    Ok(Err(e)) => warn!("connection closed with error: {e}"),
                    Err(e) => error!("connection task panicked: {e}"),
                },
            }
        }
    }

    /// Waits for every spawned connection to finish.
    #[cfg(test)]
    pub(crate) async fn run(&mut self) -> io::Result<()> {
        while let Some(res) = self.tasks.join_next().await {
            res??
        }

        Ok(())
    }

    /// Binds a new trainer to this server and spawns its own task.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: FrameReceiver<R>, tx: FrameSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shard = self.shard.clone();
        self.tasks.spawn(Self::handle(shard, rx, tx));
    }

    /// Serves the requests of a single trainer until it disconnects.
    async fn handle<R, W>(
        shard: ShardHandle,
        mut rx: FrameReceiver<R>,
        mut tx: FrameSender<W>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let id = shard.id();
        let mut rx_buf: Vec<u32> = Vec::new();
        let mut params = Vec::new();

        loop {
            let cmd = match rx.recv_into(&mut rx_buf).await? {
                Msg::Control(cmd) => cmd,
                msg => return Self::unexpected_message_kind(msg),
            };

            match cmd {
                Command::Status => {
                    let msg = Msg::Control(Command::Ready(shard.status()));
                    tx.send(&msg).await?;
                }
                Command::Init(init) => {
                    let Msg::Data(Payload::Params(values)) = rx.recv_into(&mut rx_buf).await?
                    else {
                        return Self::missing_payload("Init");
                    };

                    debug!(shard = id; "initializing shard");
                    let reply = match shard.init(init, values) {
                        Ok(status) => Msg::Control(Command::Ready(status)),
                        Err(e) => Msg::Err(e.to_string().into()),
                    };

                    tx.send(&reply).await?;
                }
                Command::Pull => match shard.pull(&mut params) {
                    Ok(()) => tx.send(&Msg::Data(Payload::Params(&mut params))).await?,
                    Err(e) => tx.send(&Msg::Err(e.to_string().into())).await?,
                },
                Command::Push { learning_rate } => {
                    let Msg::Data(Payload::Gradient(grad)) = rx.recv_into(&mut rx_buf).await?
                    else {
                        return Self::missing_payload("Push");
                    };

                    let reply = match shard.push(learning_rate, grad) {
                        Ok(global_step) => Msg::Control(Command::Applied { global_step }),
                        Err(e) => Msg::Err(e.to_string().into()),
                    };

                    tx.send(&reply).await?;
                }
                Command::Disconnect => {
                    debug!(shard = id; "disconnect requested");
                    tx.send(&Msg::Control(Command::Disconnect)).await?;
                    return Ok(());
                }
                cmd => {
                    warn!(shard = id; "ignoring unexpected command {cmd:?}");
                    let msg = Msg::Err(format!("Unexpected command {cmd:?}").into());
                    tx.send(&msg).await?;
                }
            }
        }
    }

    /// Creates an error for when an unexpected message kind is received.
    ///
    /// # Arguments
    /// * `msg` - The received message.
    ///
    /// # Returns
    /// An error.
    fn unexpected_message_kind<U>(msg: Msg) -> io::Result<U> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an unexpected message kind, got: {}", msg.kind()),
        ))
    }

    fn missing_payload<U>(command: &str) -> io::Result<U> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Expected the payload of the {command} command"),
        ))
    }
}
