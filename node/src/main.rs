use std::{env, io, thread};

use comms::specs::cluster::{ClusterConfig, ClusterSpec, TaskSpec};
use log::{info, warn};
use machine_learning::registry::Catalog;
use parameter_server::ParameterServer;
use tokio::{runtime, signal};
use trainer::{Role, TrainErr, Trainer, TrainingConfig, dispatch, start_server};

/// Holds the `{"cluster": .., "task": ..}` document, unset for local training.
const CLUSTER_VAR: &str = "CLUSTER_CONFIG";
/// Path of the json flags file, overridden by the first argument.
const CONFIG_VAR: &str = "TRAIN_CONFIG";

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ClusterConfig { cluster, task } = ClusterConfig::from_env(CLUSTER_VAR).map_err(TrainErr::from)?;

    match (dispatch(cluster.as_ref(), &task), cluster) {
        (Role::ParameterServer, Some(cluster)) => serve_parameters(&cluster, task),
        (_, cluster) => train(cluster, task, load_config()?),
    }
}

fn load_config() -> io::Result<TrainingConfig> {
    let path = env::args().nth(1).or_else(|| env::var(CONFIG_VAR).ok());

    let config = match path {
        Some(path) => {
            info!("reading flags from {path}");
            TrainingConfig::from_file(&path)?
        }
        None => TrainingConfig::default(),
    };

    Ok(config)
}

fn serve_parameters(cluster: &ClusterSpec, task: TaskSpec) -> io::Result<()> {
    info!("{task}: Starting parameter server within cluster {cluster:?}");
    let server = start_server(cluster, &task)?;

    let rt = runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = server.into_tokio()?;
        let pserver = ParameterServer::new(task.index(), Catalog::default());

        tokio::select! {
            ret = pserver.serve(listener) => ret,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                Ok(())
            }
        }
    })
}

fn train(cluster: Option<ClusterSpec>, task: TaskSpec, config: TrainingConfig) -> io::Result<()> {
    let trainer = Trainer::new(cluster, task, config, Catalog::default());
    let stop = trainer.stop_signal();

    thread::spawn(move || {
        let rt = match runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!("can't listen for ctrl-c: {e}");
                return;
            }
        };

        if rt.block_on(signal::ctrl_c()).is_ok() {
            info!("received ctrl-c, stopping after the current step");
            stop.request_stop();
        }
    });

    let report = trainer.run()?;
    info!(
        steps = report.steps,
        global_step = report.global_step;
        "{task}: training finished"
    );

    Ok(())
}
