//! Delivery dispatcher - drives queued commands to completion
//!
//! Worker tasks claim jobs from the command lane, resolve the target
//! device set, and deliver through the connection registry. Broadcast
//! fan-out is batched with an inter-batch delay as backpressure against
//! large fleets.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;

use crate::config::DispatchConfig;
use crate::db::{Command, CommandRepo, CommandStatus, CommandType, DeviceRepo, TargetType};
use crate::dispatch::{DispatchQueue, Job, Lane};
use crate::registry::ConnectionRegistry;
use crate::{Error, Result};

/// Aggregate result of a broadcast delivery
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcastOutcome {
    pub sent: Vec<String>,
    pub failed: Vec<String>,
    pub batches: usize,
}

/// Command delivery worker pool
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    devices: DeviceRepo,
    commands: CommandRepo,
    queue: DispatchQueue,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a new dispatcher
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        devices: DeviceRepo,
        commands: CommandRepo,
        queue: DispatchQueue,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            devices,
            commands,
            queue,
            config,
        }
    }

    /// Start `worker_concurrency` consumer tasks on the command lane
    pub fn spawn_consumers(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_concurrency)
            .map(|slot| {
                let dispatcher = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(slot, "dispatch worker started");
                    loop {
                        tokio::select! {
                            () = dispatcher.consume_one() => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                })
            })
            .collect()
    }

    /// Claim and process at most one job, or wait for work
    async fn consume_one(&self) {
        match self.queue.claim(Lane::Commands) {
            Ok(Some(job)) => self.run_job(&job).await,
            Ok(None) => self.queue.idle(self.config.poll_interval).await,
            Err(e) => {
                tracing::error!(error = %e, "failed to claim job");
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Process one claimed job end-to-end, settling it in the queue
    pub async fn run_job(&self, job: &Job) {
        match self.process(job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job.id) {
                    tracing::error!(job_id = %job.id, error = %e, "failed to settle job");
                }
            }
            Err(Error::NotFound(what)) => {
                // Nothing to retry against
                let _ = self.queue.fail(job, &format!("{what} missing"), false);
            }
            Err(e) => {
                let text = e.to_string();
                if let Err(db_err) = self.commands.mark_failed(&job.command_id, &text) {
                    tracing::error!(
                        command_id = %job.command_id,
                        error = %db_err,
                        "failed to record command failure"
                    );
                }
                let _ = self.queue.fail(job, &text, true);
            }
        }
    }

    /// Drive one command through the delivery state machine
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for a vanished command (permanent job
    /// failure) or [`Error::CommandExecution`] for unexpected processing
    /// failures (job-level retry applies)
    async fn process(&self, job: &Job) -> Result<()> {
        let command = self
            .commands
            .find(&job.command_id)?
            .ok_or_else(|| Error::NotFound(format!("command {}", job.command_id)))?;

        if command.status == CommandStatus::Cancelled {
            tracing::debug!(command_id = %command.id, "skipping cancelled command");
            return Ok(());
        }

        if !self.claim(&command, job)? {
            // Lost the race to a cancel or another worker
            tracing::debug!(
                command_id = %command.id,
                status = command.status.as_str(),
                "command not claimable"
            );
            return Ok(());
        }

        // A scheduled command that is not yet due goes back to the
        // scheduler lane instead of delivering early.
        if command.kind == CommandType::Scheduled {
            if let Some(due) = command.scheduled_at {
                let now = chrono::Utc::now();
                if due > now {
                    let delay = (due - now)
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    self.commands.park_pending(&command.id)?;
                    self.queue
                        .enqueue(Lane::Scheduled, &command.id, Some(delay))?;
                    tracing::info!(command_id = %command.id, due = %due, "command parked until due");
                    return Ok(());
                }
            }
        }

        match command.target_type {
            TargetType::Device => self.deliver_single(&command).await,
            TargetType::Group | TargetType::All => self.deliver_broadcast(&command).await,
        }
    }

    /// Move the command to PROCESSING, taking the retry edge when the
    /// queue re-runs a job whose earlier attempt failed
    fn claim(&self, command: &Command, job: &Job) -> Result<bool> {
        if self.commands.claim_processing(&command.id)? {
            return Ok(true);
        }
        if command.status == CommandStatus::Failed && job.attempts > 0 {
            // FAILED -> QUEUED (retry edge, retry_count += 1) -> PROCESSING
            return Ok(self.commands.retry(&command.id)?
                && self.commands.claim_processing(&command.id)?);
        }
        Ok(false)
    }

    async fn deliver_single(&self, command: &Command) -> Result<()> {
        let device_id = command
            .target_device_id
            .as_deref()
            .ok_or_else(|| Error::CommandExecution("single command without target".to_string()))?;

        if self.registry.send(device_id, command).await {
            self.commands.mark_completed(&command.id, None)?;
            tracing::info!(command_id = %command.id, device_id = %device_id, "command delivered");
        } else {
            // A handled outcome, not a job failure: no live transport
            self.commands.mark_failed(
                &command.id,
                &format!("device {device_id} unreachable"),
            )?;
            tracing::warn!(command_id = %command.id, device_id = %device_id, "target unreachable");
        }
        Ok(())
    }

    async fn deliver_broadcast(&self, command: &Command) -> Result<()> {
        let targets = self.resolve_broadcast_targets(command)?;
        let outcome = self.fan_out(command, &targets).await;

        tracing::info!(
            command_id = %command.id,
            sent = outcome.sent.len(),
            failed = outcome.failed.len(),
            batches = outcome.batches,
            "broadcast finished"
        );

        // Per-device failures are reported, never escalated to the command
        let result = serde_json::to_value(&outcome)?;
        self.commands.mark_completed(&command.id, Some(&result))?;
        Ok(())
    }

    fn resolve_broadcast_targets(&self, command: &Command) -> Result<Vec<String>> {
        match command.target_type {
            TargetType::Group => {
                let group_id = command.target_group_id.as_deref().ok_or_else(|| {
                    Error::CommandExecution("group command without target group".to_string())
                })?;
                self.devices.online_ids_in_group(group_id)
            }
            TargetType::All => self.devices.online_ids(),
            TargetType::Device => unreachable!("single targets use deliver_single"),
        }
    }

    /// Deliver to targets in batches of `B` with delay `D` between batches
    async fn fan_out(&self, command: &Command, targets: &[String]) -> BroadcastOutcome {
        let batch_size = self.config.broadcast_batch_size.max(1);
        let mut outcome = BroadcastOutcome {
            sent: Vec::new(),
            failed: Vec::new(),
            batches: 0,
        };

        let mut batches = targets.chunks(batch_size).peekable();
        while let Some(batch) = batches.next() {
            outcome.batches += 1;

            let deliveries = batch
                .iter()
                .map(|device_id| async move {
                    (device_id.clone(), self.registry.send(device_id, command).await)
                });

            for (device_id, delivered) in join_all(deliveries).await {
                if delivered {
                    outcome.sent.push(device_id);
                } else {
                    outcome.failed.push(device_id);
                }
            }

            if batches.peek().is_some() {
                tokio::time::sleep(self.config.broadcast_delay).await;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::db::{init_memory, DbPool, NewCommand};
    use crate::wire::GatewayMessage;
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<ConnectionRegistry>,
        commands: CommandRepo,
        queue: DispatchQueue,
        pool: DbPool,
    }

    fn setup() -> Harness {
        let pool = init_memory().unwrap();
        let devices = DeviceRepo::new(pool.clone());
        let commands = CommandRepo::new(pool.clone());
        let registry = Arc::new(ConnectionRegistry::new(
            devices.clone(),
            commands.clone(),
            RegistryConfig::default(),
        ));
        let queue = DispatchQueue::new(pool.clone(), 3, std::time::Duration::from_millis(10));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            devices,
            commands.clone(),
            queue.clone(),
            DispatchConfig {
                broadcast_batch_size: 2,
                broadcast_delay: std::time::Duration::from_millis(200),
                ..DispatchConfig::default()
            },
        );
        Harness {
            dispatcher,
            registry,
            commands,
            queue,
            pool,
        }
    }

    async fn connect_device(
        h: &Harness,
        uuid: &str,
    ) -> (String, mpsc::Receiver<GatewayMessage>) {
        let (tx, mut rx) = mpsc::channel(16);
        let pending_id = h.registry.accept(tx).await;
        let (device, _) = h.registry.register(&pending_id, uuid, None, None).await.unwrap();
        // Drain handshake envelopes
        rx.recv().await;
        rx.recv().await;
        (device.id, rx)
    }

    fn queued_single(h: &Harness, device_id: &str) -> Command {
        h.commands
            .create(&NewCommand {
                kind: CommandType::Single,
                target_type: TargetType::Device,
                target_device_id: Some(device_id.to_string()),
                target_group_id: None,
                command_name: "open_app".to_string(),
                params: serde_json::json!({"package": "tv"}),
                scheduled_at: None,
                created_by: "test".to_string(),
            })
            .unwrap()
    }

    fn claim_job(h: &Harness) -> Job {
        h.queue.claim(Lane::Commands).unwrap().unwrap()
    }

    #[tokio::test]
    async fn single_delivery_completes_command() {
        let h = setup();
        let (device_id, mut rx) = connect_device(&h, "dev-a").await;

        let cmd = queued_single(&h, &device_id);
        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.dispatcher.run_job(&claim_job(&h)).await;

        match rx.recv().await {
            Some(GatewayMessage::Command { command_id, command_name, .. }) => {
                assert_eq!(command_id, cmd.id);
                assert_eq!(command_name, "open_app");
            }
            other => panic!("expected command envelope, got {other:?}"),
        }

        let cmd = h.commands.find(&cmd.id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed);
        assert!(cmd.executed_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_single_target_fails_command() {
        let h = setup();
        let cmd = queued_single(&h, "ghost");
        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.dispatcher.run_job(&claim_job(&h)).await;

        let cmd = h.commands.find(&cmd.id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert!(cmd.error.unwrap().contains("unreachable"));

        // A handled delivery failure settles the job; no retry churn
        assert!(h.queue.claim(Lane::Commands).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_splits_targets_into_batches() {
        let h = setup();
        let (a, mut rx_a) = connect_device(&h, "dev-a").await;
        let (b, _rx_b) = connect_device(&h, "dev-b").await;
        let (_c, _rx_c) = connect_device(&h, "dev-c").await;

        let cmd = h
            .commands
            .create(&NewCommand {
                kind: CommandType::Broadcast,
                target_type: TargetType::All,
                target_device_id: None,
                target_group_id: None,
                command_name: "display_image".to_string(),
                params: serde_json::json!({"url": "img"}),
                scheduled_at: None,
                created_by: "test".to_string(),
            })
            .unwrap();

        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.dispatcher.run_job(&claim_job(&h)).await;

        let cmd = h.commands.find(&cmd.id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed);

        let result = cmd.result.unwrap();
        // 3 online devices, batch size 2 -> 2 batches
        assert_eq!(result["batches"], 2);
        let sent: Vec<String> =
            serde_json::from_value(result["sent"].clone()).unwrap();
        assert!(sent.contains(&a));
        assert!(sent.contains(&b));
        assert_eq!(sent.len(), 3);

        assert!(matches!(
            rx_a.recv().await,
            Some(GatewayMessage::Command { .. })
        ));
    }

    #[tokio::test]
    async fn broadcast_reports_unreachable_devices_without_aborting() {
        let h = setup();
        let (a, _rx_a) = connect_device(&h, "dev-a").await;
        let (b, rx_b) = connect_device(&h, "dev-b").await;

        // b is ONLINE in the store but its transport pump is gone, so
        // sending to it fails without aborting the batch
        drop(rx_b);

        let cmd = h
            .commands
            .create(&NewCommand {
                kind: CommandType::Broadcast,
                target_type: TargetType::All,
                target_device_id: None,
                target_group_id: None,
                command_name: "slideshow".to_string(),
                params: serde_json::json!({}),
                scheduled_at: None,
                created_by: "test".to_string(),
            })
            .unwrap();

        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.dispatcher.run_job(&claim_job(&h)).await;

        let cmd = h.commands.find(&cmd.id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed);

        let result = cmd.result.unwrap();
        let sent: Vec<String> = serde_json::from_value(result["sent"].clone()).unwrap();
        let failed: Vec<String> = serde_json::from_value(result["failed"].clone()).unwrap();
        assert_eq!(sent, vec![a]);
        assert_eq!(failed, vec![b]);
    }

    #[tokio::test]
    async fn not_yet_due_scheduled_command_is_parked() {
        let h = setup();
        let cmd = h
            .commands
            .create(&NewCommand {
                kind: CommandType::Scheduled,
                target_type: TargetType::All,
                target_device_id: None,
                target_group_id: None,
                command_name: "open_url".to_string(),
                params: serde_json::json!({}),
                scheduled_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                created_by: "test".to_string(),
            })
            .unwrap();

        // Producer promoted it into the command lane ahead of time
        h.commands.promote_due(&cmd.id).unwrap();
        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.dispatcher.run_job(&claim_job(&h)).await;

        let cmd = h.commands.find(&cmd.id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);

        // Parked into the scheduled lane, not due yet
        assert!(h.queue.claim(Lane::Scheduled).unwrap().is_none());
        assert!(h.queue.next_run_at(Lane::Scheduled).unwrap().is_some());
    }

    #[tokio::test]
    async fn vanished_command_deadletters_job() {
        let h = setup();
        // Seed a job for a command row we then delete
        let cmd = queued_single(&h, "whatever");
        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();
        h.pool
            .get()
            .unwrap()
            .execute("DELETE FROM commands WHERE id = ?1", [&cmd.id])
            .unwrap();

        let job = claim_job(&h);
        h.dispatcher.run_job(&job).await;

        let state: String = h
            .pool
            .get()
            .unwrap()
            .query_row("SELECT state FROM jobs WHERE id = ?1", [&job.id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(state, "dead");
    }

    #[tokio::test]
    async fn cancelled_command_is_never_delivered() {
        let h = setup();
        let (device_id, mut rx) = connect_device(&h, "dev-a").await;

        let cmd = queued_single(&h, &device_id);
        h.queue.enqueue(Lane::Commands, &cmd.id, None).unwrap();

        h.commands.cancel(&cmd.id).unwrap();
        h.queue.cancel_for_command(&cmd.id).unwrap();

        // Even a job claimed before the purge skips a cancelled command
        if let Ok(Some(job)) = h.queue.claim(Lane::Commands) {
            h.dispatcher.run_job(&job).await;
        }

        assert_eq!(
            h.commands.find(&cmd.id).unwrap().unwrap().status,
            CommandStatus::Cancelled
        );
        assert!(rx.try_recv().is_err());
    }
}
