//! End-to-end dispatch pipeline tests
//!
//! Wires a real registry, queue, workers, and scheduler over an
//! in-memory store and walks commands through delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_gateway::api::ApiState;
use fleet_gateway::config::DispatchConfig;
use fleet_gateway::db::{Command, CommandStatus, CommandType, Device, NewCommand, TargetType};
use fleet_gateway::wire::GatewayMessage;
use fleet_gateway::{Dispatcher, Lane, Scheduler};
use tokio::sync::{mpsc, watch};

mod common;
use common::{build_test_state, setup_test_db};

struct Pipeline {
    state: Arc<ApiState>,
    shutdown: watch::Sender<bool>,
}

impl Pipeline {
    fn start() -> Self {
        let state = build_test_state(setup_test_db());
        let config = DispatchConfig {
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(50),
            ..DispatchConfig::default()
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state.registry),
            state.device_repo.clone(),
            state.command_repo.clone(),
            state.queue.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            state.command_repo.clone(),
            state.queue.clone(),
            config,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        dispatcher.spawn_consumers(&shutdown_rx);
        let _ = scheduler.spawn(&shutdown_rx);

        Self { state, shutdown }
    }

    async fn connect_device(&self, uuid: &str) -> (Device, mpsc::Receiver<GatewayMessage>) {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = self.state.registry.accept(tx).await;
        let (device, _token) = self
            .state
            .registry
            .register(&pending, uuid, None, None)
            .await
            .expect("registration failed");

        // Drain the connected and registered acks
        rx.recv().await;
        rx.recv().await;
        (device, rx)
    }

    fn create(&self, new: &NewCommand) -> Command {
        self.state.command_repo.create(new).expect("create failed")
    }

    async fn wait_for_status(&self, id: &str, want: CommandStatus) -> Command {
        for _ in 0..100 {
            let command = self
                .state
                .command_repo
                .find(id)
                .expect("find failed")
                .expect("command vanished");
            if command.status == want {
                return command;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("command {id} never reached {want:?}");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn single_to(device_id: &str) -> NewCommand {
    NewCommand {
        kind: CommandType::Single,
        target_type: TargetType::Device,
        target_device_id: Some(device_id.to_string()),
        target_group_id: None,
        command_name: "open_app".to_string(),
        params: serde_json::json!({"app": "netflix"}),
        scheduled_at: None,
        created_by: "operator-1".to_string(),
    }
}

#[tokio::test]
async fn single_command_reaches_connected_device() {
    let pipeline = Pipeline::start();
    let (device, mut rx) = pipeline.connect_device("tv-1").await;

    let command = pipeline.create(&single_to(&device.id));
    pipeline
        .state
        .queue
        .enqueue(Lane::Commands, &command.id, None)
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no envelope within timeout")
        .expect("channel closed");
    match envelope {
        GatewayMessage::Command {
            command_id,
            command_name,
            params,
        } => {
            assert_eq!(command_id, command.id);
            assert_eq!(command_name, "open_app");
            assert_eq!(params["app"], "netflix");
        }
        other => panic!("expected command envelope, got {other:?}"),
    }

    // Delivery success marks the command completed
    let done = pipeline
        .wait_for_status(&command.id, CommandStatus::Completed)
        .await;
    assert!(done.executed_at.is_some());
}

#[tokio::test]
async fn device_reported_failure_revises_outcome() {
    let pipeline = Pipeline::start();
    let (device, mut rx) = pipeline.connect_device("tv-1").await;

    let command = pipeline.create(&single_to(&device.id));
    pipeline
        .state
        .queue
        .enqueue(Lane::Commands, &command.id, None)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no envelope within timeout");
    pipeline
        .wait_for_status(&command.id, CommandStatus::Completed)
        .await;

    // The device's word wins over the optimistic completion
    pipeline
        .state
        .registry
        .record_result(&command.id, None, Some("app crashed"))
        .unwrap();

    let failed = pipeline
        .wait_for_status(&command.id, CommandStatus::Failed)
        .await;
    assert_eq!(failed.error.as_deref(), Some("app crashed"));
}

#[tokio::test]
async fn command_to_disconnected_device_fails() {
    let pipeline = Pipeline::start();

    let device = pipeline
        .state
        .device_repo
        .register("tv-offline", None, None)
        .unwrap();

    let command = pipeline.create(&single_to(&device.id));
    pipeline
        .state
        .queue
        .enqueue(Lane::Commands, &command.id, None)
        .unwrap();

    let failed = pipeline
        .wait_for_status(&command.id, CommandStatus::Failed)
        .await;
    assert!(failed.error.is_some());
}

#[tokio::test]
async fn broadcast_reaches_all_online_devices() {
    let pipeline = Pipeline::start();
    let (_, mut rx1) = pipeline.connect_device("tv-1").await;
    let (_, mut rx2) = pipeline.connect_device("tv-2").await;

    let command = pipeline.create(&NewCommand {
        kind: CommandType::Broadcast,
        target_type: TargetType::All,
        target_device_id: None,
        target_group_id: None,
        command_name: "show_banner".to_string(),
        params: serde_json::json!({"text": "closing soon"}),
        scheduled_at: None,
        created_by: "operator-1".to_string(),
    });
    pipeline
        .state
        .queue
        .enqueue(Lane::Commands, &command.id, None)
        .unwrap();

    for rx in [&mut rx1, &mut rx2] {
        let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no envelope within timeout")
            .expect("channel closed");
        assert!(matches!(envelope, GatewayMessage::Command { .. }));
    }

    let done = pipeline
        .wait_for_status(&command.id, CommandStatus::Completed)
        .await;
    let outcome = done.result.expect("broadcast outcome missing");
    assert_eq!(outcome["sent"].as_array().unwrap().len(), 2);
    assert!(outcome["failed"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn scheduled_command_waits_for_due_time() {
    let pipeline = Pipeline::start();
    let (device, mut rx) = pipeline.connect_device("tv-1").await;

    let due = Utc::now() + chrono::Duration::milliseconds(300);
    let command = pipeline.create(&NewCommand {
        scheduled_at: Some(due),
        kind: CommandType::Scheduled,
        ..single_to(&device.id)
    });
    assert_eq!(command.status, CommandStatus::Pending);

    pipeline
        .state
        .queue
        .enqueue(Lane::Scheduled, &command.id, Some(Duration::from_millis(300)))
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no envelope within timeout")
        .expect("channel closed");
    assert!(matches!(envelope, GatewayMessage::Command { .. }));
    assert!(Utc::now() >= due);

    pipeline
        .wait_for_status(&command.id, CommandStatus::Completed)
        .await;
}

#[tokio::test]
async fn cancelled_command_is_never_delivered() {
    let pipeline = Pipeline::start();
    let (device, mut rx) = pipeline.connect_device("tv-1").await;

    let command = pipeline.create(&single_to(&device.id));
    assert!(pipeline.state.command_repo.cancel(&command.id).unwrap());
    pipeline
        .state
        .queue
        .enqueue(Lane::Commands, &command.id, None)
        .unwrap();

    // The worker sees CANCELLED and drops the job on the floor
    let delivered = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(delivered.is_err(), "cancelled command was delivered");
    assert_eq!(
        pipeline
            .state
            .command_repo
            .find(&command.id)
            .unwrap()
            .unwrap()
            .status,
        CommandStatus::Cancelled
    );
}
