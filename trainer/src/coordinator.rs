//! Decides the role of this process and where the variables of the model live.

use std::{io, net};

use comms::specs::cluster::{ClusterSpec, TaskSpec, TaskType};
use log::info;
use machine_learning::variables::VariableStore;

use crate::{Result, TrainErr};

/// What this process does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Runs the training loop, as the master or as a worker.
    Trainer,
    ParameterServer,
}

/// Selects the role of `task`.
///
/// Without a cluster the process always trains on its own.
pub fn dispatch(cluster: Option<&ClusterSpec>, task: &TaskSpec) -> Role {
    match (cluster, task.task_type()) {
        (Some(_), TaskType::Ps) => Role::ParameterServer,
        _ => Role::Trainer,
    }
}

/// The bound listening endpoint of this task.
///
/// A parameter server accepts trainers on it. A trainer holds it for the whole run, which
/// claims the task's address so a second process started as the same task fails to bind.
#[derive(Debug)]
pub struct Server {
    listener: net::TcpListener,
}

impl Server {
    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Hands the listener to the tokio runtime, must be called from within one.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpListener> {
        self.listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(self.listener)
    }
}

/// Binds the address `cluster` lists for `task`.
///
/// # Returns
/// The server or an error if the task isn't part of the cluster or the address can't be bound.
pub fn start_server(cluster: &ClusterSpec, task: &TaskSpec) -> Result<Server> {
    let addr = cluster.addr(task)?;
    let server = Server {
        listener: net::TcpListener::bind(addr)?,
    };
    info!("{task}: listening on {}", server.local_addr()?);

    Ok(server)
}

/// Assigns every trainable variable to a parameter server task, round robin in declaration
/// order, and the computation to the local task.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePlacement {
    worker_device: String,
    ps_addrs: Vec<String>,
    /// `(variable, ps task)` in trainable order.
    assignments: Vec<(String, usize)>,
}

impl DevicePlacement {
    /// Creates a new `DevicePlacement`.
    ///
    /// # Returns
    /// The placement or a configuration error if the cluster has no parameter server.
    pub fn new(cluster: &ClusterSpec, task: &TaskSpec, store: &VariableStore) -> Result<Self> {
        let ps_addrs = cluster.tasks(TaskType::Ps).to_vec();
        if ps_addrs.is_empty() {
            return Err(TrainErr::Config(
                "a cluster needs at least one ps task to hold the variables".into(),
            ));
        }

        let assignments = store
            .trainable()
            .enumerate()
            .map(|(i, var)| (var.name().to_string(), i % ps_addrs.len()))
            .collect();

        Ok(Self {
            worker_device: task.to_string(),
            ps_addrs,
            assignments,
        })
    }

    pub fn worker_device(&self) -> &str {
        &self.worker_device
    }

    pub fn ps_addrs(&self) -> &[String] {
        &self.ps_addrs
    }

    pub fn num_shards(&self) -> usize {
        self.ps_addrs.len()
    }

    /// Returns the trainable indices held by each shard, in order.
    pub fn shards(&self) -> Vec<Vec<usize>> {
        let mut shards = vec![Vec::new(); self.num_shards()];

        for (i, (_, shard)) in self.assignments.iter().enumerate() {
            shards[*shard].push(i);
        }

        shards
    }

    pub fn assignments(&self) -> &[(String, usize)] {
        &self.assignments
    }

    /// Logs the device of every variable and of the computation.
    pub fn log(&self) {
        for (name, shard) in &self.assignments {
            info!("{name}: /job:ps/task:{shard}");
        }

        info!("computation: {}", self.worker_device);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use machine_learning::variables::Variable;

    use super::*;

    fn cluster(ps: usize) -> ClusterSpec {
        let mut jobs = BTreeMap::new();
        jobs.insert(TaskType::Master, vec!["127.0.0.1:0".to_string()]);
        jobs.insert(
            TaskType::Ps,
            (0..ps).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect(),
        );
        ClusterSpec::new(jobs).unwrap()
    }

    #[test]
    fn roles_follow_the_task_type() {
        let ps = TaskSpec::new(TaskType::Ps, 0).unwrap();
        let worker = TaskSpec::new(TaskType::Worker, 1).unwrap();

        assert_eq!(dispatch(None, &ps), Role::Trainer);
        assert_eq!(dispatch(Some(&cluster(1)), &ps), Role::ParameterServer);
        assert_eq!(dispatch(Some(&cluster(1)), &worker), Role::Trainer);
        assert_eq!(dispatch(None, &TaskSpec::default()), Role::Trainer);
    }

    #[test]
    fn trainable_variables_are_spread_round_robin() {
        let store = VariableStore::new(vec![
            Variable::zeros("a", vec![2], true),
            Variable::zeros("b", vec![2], true),
            Variable::zeros("moving", vec![2], false),
            Variable::zeros("c", vec![2], true),
        ])
        .unwrap();

        let placement = DevicePlacement::new(&cluster(2), &TaskSpec::default(), &store).unwrap();

        assert_eq!(placement.shards(), vec![vec![0, 2], vec![1]]);
        assert_eq!(placement.assignments()[2], ("c".to_string(), 0));
        assert_eq!(placement.worker_device(), "/job:master/task:0");
    }

    #[test]
    fn a_cluster_without_ps_is_rejected() {
        let store = VariableStore::new(vec![Variable::zeros("a", vec![1], true)]).unwrap();
        let err = DevicePlacement::new(&cluster(0), &TaskSpec::default(), &store).unwrap_err();
        assert!(matches!(err, TrainErr::Config(_)));
    }

    #[test]
    fn the_task_address_is_bound() {
        let server = start_server(&cluster(1), &TaskSpec::default()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn a_second_process_for_the_same_task_cannot_bind() {
        let first = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap().to_string();

        let mut jobs = BTreeMap::new();
        jobs.insert(TaskType::Master, vec![addr]);
        jobs.insert(TaskType::Ps, vec!["127.0.0.1:7000".to_string()]);
        let cluster = ClusterSpec::new(jobs).unwrap();

        let err = start_server(&cluster, &TaskSpec::default()).unwrap_err();
        assert!(matches!(err, TrainErr::Io(e) if e.kind() == io::ErrorKind::AddrInUse));
    }
}
