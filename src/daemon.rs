//! Daemon - the fleet gateway service
//!
//! Wires the store, connection registry, dispatch pipeline, and API
//! server together and owns their shutdown.

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::{self, ApiState};
use crate::db::{self, CommandRepo, DbPool, DeviceRepo};
use crate::dispatch::{Dispatcher, DispatchQueue, Scheduler};
use crate::registry::ConnectionRegistry;
use crate::{Config, Result};

/// The fleet gateway daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or database cannot be set up
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("fleet.db");
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "database ready");
        Ok(Self { config, db })
    }

    /// Run the daemon until interrupted
    ///
    /// Spawns the registry sweepers, the dispatch workers, and the
    /// scheduler, then serves the API. Ctrl-C flips the shutdown
    /// signal; background tasks drain before the process exits.
    ///
    /// # Errors
    ///
    /// Returns error if the API server fails
    pub async fn run(self) -> Result<()> {
        let devices = DeviceRepo::new(self.db.clone());
        let commands = CommandRepo::new(self.db.clone());
        let queue = DispatchQueue::new(
            self.db.clone(),
            self.config.dispatch.max_job_attempts,
            self.config.dispatch.retry_backoff,
        );

        let registry = Arc::new(ConnectionRegistry::new(
            devices.clone(),
            commands.clone(),
            self.config.registry.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            devices.clone(),
            commands.clone(),
            queue.clone(),
            self.config.dispatch.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            commands.clone(),
            queue.clone(),
            self.config.dispatch.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = registry.spawn_sweepers(shutdown_rx.clone());
        tasks.extend(dispatcher.spawn_consumers(&shutdown_rx));
        tasks.push(scheduler.spawn(&shutdown_rx));

        let state = Arc::new(ApiState {
            db: self.db.clone(),
            registry,
            device_repo: devices,
            command_repo: commands,
            queue,
            outbound_buffer: self.config.registry.outbound_buffer,
        });

        tracing::info!(
            port = self.config.server.port,
            workers = self.config.dispatch.worker_concurrency,
            "fleet gateway running"
        );

        tokio::select! {
            result = api::serve(state, self.config.server.port) => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }

        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }

        tracing::info!("fleet gateway stopped");
        Ok(())
    }
}
