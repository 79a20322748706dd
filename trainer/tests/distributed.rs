mod common;

use std::{net, thread};

use comms::specs::cluster::{ClusterConfig, TaskType};
use machine_learning::registry::Catalog;
use parameter_server::ParameterServer;
use tokio::runtime::Runtime;
use trainer::{Role, Trainer, checkpoint, dispatch, graph::GraphBuilder};

use common::{config, write_dataset};

/// Serves shard 0 on a background thread.
///
/// # Returns
/// The address of the parameter server.
fn spawn_parameter_server() -> String {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    listener.set_nonblocking(true).unwrap();

    thread::spawn(move || {
        let rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            ParameterServer::new(0, Catalog::default()).serve(listener).await
        })
    });

    addr
}

fn free_addr() -> String {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[test]
fn master_and_worker_share_the_parameter_server() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = write_dataset(dir.path(), 40, 2);
    let ps = spawn_parameter_server();

    let cluster_json = format!(
        r#""cluster": {{"master": ["{}"], "worker": ["{}"], "ps": ["{ps}"]}}"#,
        free_addr(),
        free_addr()
    );

    let master = ClusterConfig::from_json(&format!(
        r#"{{{cluster_json}, "task": {{"type": "master", "index": 0}}}}"#
    ))
    .unwrap();
    assert_eq!(dispatch(master.cluster.as_ref(), &master.task), Role::Trainer);

    let mut master_config = config(&dir.path().join("master"), &pattern);
    master_config.log_device_placement = true;

    let report = Trainer::new(master.cluster, master.task, master_config, Catalog::default())
        .run()
        .unwrap();

    assert_eq!(report.steps, 4);
    assert_eq!(report.global_step, 4);
    assert_eq!(report.metric_events, 4);
    assert_eq!(report.exported.len(), 4);
    assert!(report.checkpoint.is_some());

    // The shards are already initialized, the worker picks up the shared global step.
    let worker = ClusterConfig::from_json(&format!(
        r#"{{{cluster_json}, "task": {{"type": "worker", "index": 0}}}}"#
    ))
    .unwrap();
    assert_eq!(worker.task.task_type(), TaskType::Worker);

    let worker_dir = dir.path().join("worker");
    let report = Trainer::new(
        worker.cluster,
        worker.task,
        config(&worker_dir, &pattern),
        Catalog::default(),
    )
    .run()
    .unwrap();

    assert_eq!(report.steps, 4);
    assert_eq!(report.global_step, 8);
    assert_eq!(report.metric_events, 0);
    assert!(report.exported.is_empty());
    assert!(report.checkpoint.is_none());
    assert!(!worker_dir.join("autoencoder_layer0.model").exists());
}

#[test]
fn periodic_checkpoints_hold_the_parameters_after_the_update() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = write_dataset(dir.path(), 20, 1);
    let ps = spawn_parameter_server();

    let master = ClusterConfig::from_json(&format!(
        r#"{{"cluster": {{"master": ["{}"], "ps": ["{ps}"]}}, "task": {{"type": "master", "index": 0}}}}"#,
        free_addr()
    ))
    .unwrap();

    let train_dir = dir.path().join("train");
    let config = config(&train_dir, &pattern);
    let init = GraphBuilder::new(&Catalog::default(), &config)
        .build()
        .unwrap()
        .variables;

    let report = Trainer::new(master.cluster, master.task, config, Catalog::default())
        .run()
        .unwrap();
    assert_eq!(report.global_step, 2);

    // Written by the first interval, right after step 1.
    let first = checkpoint::restore(&train_dir.join("model.ckpt-1")).unwrap();
    assert_eq!(first.global_step, 1);

    let changed = init
        .trainable()
        .filter(|var| first.variables.get(var.name()).unwrap().data() != var.data())
        .count();
    assert!(changed > 0);
}

#[test]
fn parameter_server_tasks_never_train() {
    let json = r#"{"cluster": {"master": ["a:1"], "ps": ["b:2"]}, "task": {"type": "ps", "index": 0}}"#;
    let ps = ClusterConfig::from_json(json).unwrap();
    assert_eq!(dispatch(ps.cluster.as_ref(), &ps.task), Role::ParameterServer);

    let local = ClusterConfig::from_json(r#"{"task": {"type": "ps", "index": 0}}"#).unwrap();
    assert_eq!(dispatch(local.cluster.as_ref(), &local.task), Role::Trainer);
}
