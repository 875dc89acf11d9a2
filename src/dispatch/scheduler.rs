//! Scheduled-command lane
//!
//! A single consumer on the `scheduled` queue that promotes commands
//! back into the command lane when their due time arrives. Delivery
//! itself always goes through the dispatcher, so batching and failure
//! accounting live in one place.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::DispatchConfig;
use crate::db::{CommandRepo, CommandStatus};
use crate::dispatch::{DispatchQueue, Job, Lane};
use crate::{Error, Result};

/// Scheduled lane consumer
pub struct Scheduler {
    commands: CommandRepo,
    queue: DispatchQueue,
    config: DispatchConfig,
}

impl Scheduler {
    /// Create a new scheduler
    #[must_use]
    pub fn new(commands: CommandRepo, queue: DispatchQueue, config: DispatchConfig) -> Self {
        Self {
            commands,
            queue,
            config,
        }
    }

    /// Start the scheduled-lane consumer task
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tracing::debug!("scheduler started");
            loop {
                tokio::select! {
                    () = scheduler.consume_one() => {}
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn consume_one(&self) {
        match self.queue.claim(Lane::Scheduled) {
            Ok(Some(job)) => {
                if let Err(e) = self.activate(&job) {
                    tracing::error!(
                        command_id = %job.command_id,
                        error = %e,
                        "failed to activate scheduled command"
                    );
                    let _ = self.queue.fail(&job, &e.to_string(), true);
                } else if let Err(e) = self.queue.complete(&job.id) {
                    tracing::error!(job_id = %job.id, error = %e, "failed to settle scheduler job");
                }
            }
            Ok(None) => self.sleep_until_next_due().await,
            Err(e) => {
                tracing::error!(error = %e, "failed to claim scheduled job");
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Promote a due command: PENDING -> QUEUED, then the command lane
    ///
    /// Cancelled or vanished commands are skipped without error.
    ///
    /// # Errors
    ///
    /// Returns error if a database or queue operation fails
    fn activate(&self, job: &Job) -> Result<()> {
        let Some(command) = self.commands.find(&job.command_id)? else {
            tracing::warn!(command_id = %job.command_id, "scheduled command vanished, skipping");
            return Ok(());
        };

        if command.status == CommandStatus::Cancelled {
            tracing::debug!(command_id = %command.id, "scheduled command cancelled, skipping");
            return Ok(());
        }

        if !self.commands.promote_due(&command.id)? {
            // Raced with a cancel or manual requeue; nothing to do
            tracing::debug!(
                command_id = %command.id,
                status = command.status.as_str(),
                "scheduled command not promotable"
            );
            return Ok(());
        }

        self.queue
            .enqueue(Lane::Commands, &command.id, None)
            .map_err(|e| Error::Queue(e.to_string()))?;
        tracing::info!(command_id = %command.id, "scheduled command activated");
        Ok(())
    }

    /// Sleep until the next delayed job could be due, capped at the poll interval
    async fn sleep_until_next_due(&self) {
        let wait = self
            .queue
            .next_run_at(Lane::Scheduled)
            .ok()
            .flatten()
            .and_then(|due| (due - chrono::Utc::now()).to_std().ok())
            .map_or(self.config.poll_interval, |until_due| {
                until_due.min(self.config.poll_interval)
            });

        self.queue.idle(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, CommandType, NewCommand, TargetType};

    fn setup() -> (Scheduler, CommandRepo, DispatchQueue) {
        let pool = init_memory().unwrap();
        let commands = CommandRepo::new(pool.clone());
        let queue = DispatchQueue::new(pool, 3, std::time::Duration::from_millis(10));
        let scheduler = Scheduler::new(commands.clone(), queue.clone(), DispatchConfig::default());
        (scheduler, commands, queue)
    }

    fn scheduled_command(commands: &CommandRepo) -> crate::db::Command {
        commands
            .create(&NewCommand {
                kind: CommandType::Scheduled,
                target_type: TargetType::All,
                target_device_id: None,
                target_group_id: None,
                command_name: "slideshow".to_string(),
                params: serde_json::json!({}),
                scheduled_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                created_by: "test".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn due_command_moves_to_command_lane() {
        let (scheduler, commands, queue) = setup();
        let cmd = scheduled_command(&commands);
        queue.enqueue(Lane::Scheduled, &cmd.id, None).unwrap();

        let job = queue.claim(Lane::Scheduled).unwrap().unwrap();
        scheduler.activate(&job).unwrap();

        assert_eq!(
            commands.find(&cmd.id).unwrap().unwrap().status,
            CommandStatus::Queued
        );
        let promoted = queue.claim(Lane::Commands).unwrap().unwrap();
        assert_eq!(promoted.command_id, cmd.id);
    }

    #[test]
    fn cancelled_command_is_skipped() {
        let (scheduler, commands, queue) = setup();
        let cmd = scheduled_command(&commands);
        queue.enqueue(Lane::Scheduled, &cmd.id, None).unwrap();
        commands.cancel(&cmd.id).unwrap();

        let job = queue.claim(Lane::Scheduled).unwrap().unwrap();
        scheduler.activate(&job).unwrap();

        assert_eq!(
            commands.find(&cmd.id).unwrap().unwrap().status,
            CommandStatus::Cancelled
        );
        assert!(queue.claim(Lane::Commands).unwrap().is_none());
    }

    #[test]
    fn vanished_command_is_skipped_without_error() {
        let (scheduler, _commands, queue) = setup();

        let job = Job {
            id: "j-1".to_string(),
            lane: Lane::Scheduled,
            command_id: "no-such-command".to_string(),
            attempts: 0,
        };
        scheduler.activate(&job).unwrap();
    }
}
