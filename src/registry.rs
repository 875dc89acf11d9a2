//! Connection registry - the single authority for device reachability
//!
//! Owns every live transport handle and the registration handshake.
//! Transports are represented by the per-socket outbound channel; the
//! socket task that owns the actual WebSocket drains that channel, so
//! dropping a sender here is how a connection gets closed. Both maps
//! live behind one mutex, which serializes registrations, heartbeats,
//! sends, and sweeps for any given device id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::db::{Command, CommandRepo, Device, DeviceRepo};
use crate::wire::GatewayMessage;
use crate::{Error, Result};

/// Transient id for a connection that has not yet registered
pub type PendingId = String;

/// Identity of one bound transport; a re-registration mints a new token
pub type ConnectionToken = String;

struct ActiveConnection {
    token: ConnectionToken,
    sender: mpsc::Sender<GatewayMessage>,
}

struct PendingConnection {
    sender: mpsc::Sender<GatewayMessage>,
    accepted_at: Instant,
}

#[derive(Default)]
struct Inner {
    /// device id -> live transport; at most one entry per device
    active: HashMap<String, ActiveConnection>,
    /// accepted but unidentified transports
    pending: HashMap<PendingId, PendingConnection>,
}

/// Registry of live device connections
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    devices: DeviceRepo,
    commands: CommandRepo,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a new registry
    #[must_use]
    pub fn new(devices: DeviceRepo, commands: CommandRepo, config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            devices,
            commands,
            config,
        }
    }

    /// Accept a freshly opened transport
    ///
    /// Records it as pending and acknowledges with a `connected`
    /// envelope. The transport participates in nothing until it
    /// completes registration.
    pub async fn accept(&self, sender: mpsc::Sender<GatewayMessage>) -> PendingId {
        let pending_id = Uuid::new_v4().to_string();
        let _ = sender.try_send(GatewayMessage::Connected);

        let mut inner = self.inner.lock().await;
        inner.pending.insert(
            pending_id.clone(),
            PendingConnection {
                sender,
                accepted_at: Instant::now(),
            },
        );

        tracing::debug!(pending_id = %pending_id, "connection accepted, awaiting identification");
        pending_id
    }

    /// Complete the registration handshake for a pending connection
    ///
    /// Upserts the device record (ONLINE, heartbeat refreshed), moves the
    /// transport from pending to active - displacing any prior transport
    /// bound to the same device id - and replies with the assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] for an empty uuid, or a database
    /// error from the upsert
    pub async fn register(
        &self,
        pending_id: &str,
        uuid: &str,
        name: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(Device, ConnectionToken)> {
        let pending = {
            let mut inner = self.inner.lock().await;
            inner
                .pending
                .remove(pending_id)
                .ok_or_else(|| Error::Protocol("unknown pending connection".to_string()))?
        };

        let device = match self.devices.register(uuid, name, metadata) {
            Ok(device) => device,
            Err(e) => {
                // Put the transport back; the device may retry registration
                self.inner.lock().await.pending.insert(
                    pending_id.to_string(),
                    PendingConnection {
                        sender: pending.sender,
                        accepted_at: pending.accepted_at,
                    },
                );
                return Err(e);
            }
        };
        let token = Uuid::new_v4().to_string();

        let mut inner = self.inner.lock().await;

        let _ = pending.sender.try_send(GatewayMessage::Registered {
            device_id: device.id.clone(),
        });

        // Dropping the displaced sender closes the old socket's pump
        if let Some(prior) = inner.active.insert(
            device.id.clone(),
            ActiveConnection {
                token: token.clone(),
                sender: pending.sender,
            },
        ) {
            drop(prior);
            tracing::info!(device_id = %device.id, "displaced prior connection on re-registration");
        }

        tracing::info!(device_id = %device.id, uuid = %device.uuid, "device registered");
        Ok((device, token))
    }

    /// Process a heartbeat from a registered device
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnregisteredDevice`] when the device has no
    /// active transport
    pub async fn heartbeat(&self, device_id: &str) -> Result<()> {
        let sender = {
            let inner = self.inner.lock().await;
            inner
                .active
                .get(device_id)
                .map(|c| c.sender.clone())
                .ok_or(Error::UnregisteredDevice)?
        };

        self.devices.touch_heartbeat(device_id)?;
        let _ = sender.try_send(GatewayMessage::HeartbeatAck);
        Ok(())
    }

    /// Record a device-reported command result
    ///
    /// # Errors
    ///
    /// Returns error if the database update fails
    pub fn record_result(
        &self,
        command_id: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = self.commands.record_result(command_id, result, error)?;
        if updated {
            tracing::debug!(
                command_id = %command_id,
                failed = error.is_some(),
                "command result recorded"
            );
        } else {
            tracing::warn!(command_id = %command_id, "result for unknown or settled command");
        }
        Ok(())
    }

    /// Deliver a command envelope to a device's live transport
    ///
    /// Fire-and-forget: returns `false` without error when no transport
    /// is bound or the transport is not writable (outbound channel full
    /// or closed). Execution confirmation arrives later through
    /// [`Self::record_result`].
    pub async fn send(&self, device_id: &str, command: &Command) -> bool {
        let inner = self.inner.lock().await;
        let Some(conn) = inner.active.get(device_id) else {
            return false;
        };

        conn.sender
            .try_send(GatewayMessage::Command {
                command_id: command.id.clone(),
                command_name: command.command_name.clone(),
                params: command.params.clone(),
            })
            .is_ok()
    }

    /// Whether a device currently has a live transport
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.inner.lock().await.active.contains_key(device_id)
    }

    /// Number of registered live connections
    pub async fn connected_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// Remove the binding for a closed transport
    ///
    /// The socket task calls this with the token it was handed at
    /// registration, so only the exact connection that closed is
    /// removed - a replacement that registered in the meantime stays.
    /// The device is not marked OFFLINE here; the liveness sweep owns
    /// that transition, tolerating transient reconnects.
    pub async fn drop_connection(&self, device_id: &str, token: &str) {
        let mut inner = self.inner.lock().await;
        if inner
            .active
            .get(device_id)
            .is_some_and(|c| c.token == token)
        {
            inner.active.remove(device_id);
            tracing::info!(device_id = %device_id, "connection closed");
        }
    }

    /// Discard a pending connection that closed before registering
    pub async fn drop_pending(&self, pending_id: &str) {
        self.inner.lock().await.pending.remove(pending_id);
    }

    /// Demote ONLINE devices whose heartbeat lapsed and drop their transports
    ///
    /// The sole mechanism that ever transitions a device to OFFLINE.
    ///
    /// # Errors
    ///
    /// Returns error if the staleness query fails; per-device update
    /// failures are logged and skipped
    pub async fn sweep_liveness(&self) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let cutoff = Utc::now() - timeout;
        let stale = self.devices.stale_online(cutoff)?;
        let mut count = 0;

        for device in stale {
            // Conditional demote: a device that re-registered or
            // heartbeated since the staleness query keeps its status,
            // and its fresh transport stays bound.
            match self.devices.demote_stale(&device.id, cutoff) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(device_id = %device.id, error = %e, "failed to demote device");
                    continue;
                }
            }

            // Best-effort close: dropping the sender ends the socket pump
            self.inner.lock().await.active.remove(&device.id);
            tracing::info!(device_id = %device.id, uuid = %device.uuid, "device marked offline");
            count += 1;
        }

        Ok(count)
    }

    /// Discard pending connections older than the configured TTL
    pub async fn sweep_pending(&self) -> usize {
        let ttl = self.config.pending_ttl;
        let mut inner = self.inner.lock().await;
        let before = inner.pending.len();
        inner.pending.retain(|_, p| p.accepted_at.elapsed() < ttl);
        let dropped = before - inner.pending.len();

        if dropped > 0 {
            tracing::info!(dropped, "swept abandoned pending connections");
        }
        dropped
    }

    /// Start the recurring liveness and pending sweeps
    ///
    /// Both tasks stop when the shutdown signal flips, so the daemon
    /// owns their lifetime rather than leaving detached timers behind.
    pub fn spawn_sweepers(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let liveness = {
            let registry = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(registry.config.sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = registry.sweep_liveness().await {
                                tracing::error!(error = %e, "liveness sweep failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let pending = {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(registry.config.pending_sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            registry.sweep_pending().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        vec![liveness, pending]
    }
}
