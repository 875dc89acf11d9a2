//! Shared test utilities

use std::sync::Arc;

use fleet_gateway::api::ApiState;
use fleet_gateway::config::{DispatchConfig, RegistryConfig};
use fleet_gateway::db::{self, CommandRepo, DeviceRepo};
use fleet_gateway::{ConnectionRegistry, DbPool, DispatchQueue};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Build a fully wired API state over the given pool
#[must_use]
pub fn build_test_state(db: DbPool) -> Arc<ApiState> {
    let dispatch = DispatchConfig::default();
    let registry_config = RegistryConfig::default();

    let device_repo = DeviceRepo::new(db.clone());
    let command_repo = CommandRepo::new(db.clone());
    let queue = DispatchQueue::new(db.clone(), dispatch.max_job_attempts, dispatch.retry_backoff);
    let registry = Arc::new(ConnectionRegistry::new(
        device_repo.clone(),
        command_repo.clone(),
        registry_config.clone(),
    ));

    Arc::new(ApiState {
        db,
        registry,
        device_repo,
        command_repo,
        queue,
        outbound_buffer: registry_config.outbound_buffer,
    })
}
