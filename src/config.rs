//! Configuration management for the fleet gateway

use std::path::PathBuf;
use std::time::Duration;

/// Fleet gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database lives here)
    pub data_dir: PathBuf,

    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// Connection registry tunables
    pub registry: RegistryConfig,

    /// Dispatch pipeline tunables
    pub dispatch: DispatchConfig,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Connection registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A device with no heartbeat for this long is demoted to OFFLINE
    pub heartbeat_timeout: Duration,

    /// Period of the liveness sweep
    pub sweep_interval: Duration,

    /// A pending connection older than this is dropped unregistered
    pub pending_ttl: Duration,

    /// Period of the pending-connection sweep
    pub pending_sweep_interval: Duration,

    /// Capacity of each connection's outbound channel; a full channel
    /// counts as not writable
    pub outbound_buffer: usize,
}

/// Dispatch pipeline tunables
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent worker slots consuming the command lane
    pub worker_concurrency: usize,

    /// Broadcast batch size `B`
    pub broadcast_batch_size: usize,

    /// Inter-batch delay `D`
    pub broadcast_delay: Duration,

    /// Maximum delivery attempts per job before it is deadlettered
    pub max_job_attempts: u32,

    /// Base delay for exponential job retry backoff
    pub retry_backoff: Duration,

    /// Polling interval for delayed jobs when the queue is idle
    pub poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(90_000),
            sweep_interval: Duration::from_millis(30_000),
            pending_ttl: Duration::from_secs(5 * 60),
            pending_sweep_interval: Duration::from_secs(60),
            outbound_buffer: 32,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 5,
            broadcast_batch_size: 10,
            broadcast_delay: Duration::from_millis(200),
            max_job_attempts: 3,
            retry_backoff: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Reads from:
    /// - `FLEET_DATA_DIR`: data directory (default: `./data`)
    /// - `FLEET_PORT`: server port
    /// - `FLEET_HEARTBEAT_TIMEOUT_MS`: liveness timeout
    /// - `FLEET_SWEEP_INTERVAL_MS`: liveness sweep period
    /// - `FLEET_PENDING_TTL_MS`: pending connection TTL
    /// - `FLEET_BROADCAST_BATCH_SIZE`: broadcast batch size
    /// - `FLEET_BROADCAST_DELAY_MS`: inter-batch delay
    /// - `FLEET_WORKER_CONCURRENCY`: dispatcher worker slots
    /// - `FLEET_MAX_JOB_ATTEMPTS`: job retry ceiling
    #[must_use]
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FLEET_DATA_DIR")
            .map_or_else(|_| PathBuf::from("./data"), PathBuf::from);

        let mut server = ServerConfig::default();
        if let Some(port) = env_parse("FLEET_PORT") {
            server.port = port;
        }

        let mut registry = RegistryConfig::default();
        if let Some(ms) = env_parse("FLEET_HEARTBEAT_TIMEOUT_MS") {
            registry.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("FLEET_SWEEP_INTERVAL_MS") {
            registry.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("FLEET_PENDING_TTL_MS") {
            registry.pending_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("FLEET_PENDING_SWEEP_INTERVAL_MS") {
            registry.pending_sweep_interval = Duration::from_millis(ms);
        }

        let mut dispatch = DispatchConfig::default();
        if let Some(n) = env_parse("FLEET_WORKER_CONCURRENCY") {
            dispatch.worker_concurrency = n;
        }
        if let Some(n) = env_parse("FLEET_BROADCAST_BATCH_SIZE") {
            dispatch.broadcast_batch_size = n;
        }
        if let Some(ms) = env_parse("FLEET_BROADCAST_DELAY_MS") {
            dispatch.broadcast_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("FLEET_MAX_JOB_ATTEMPTS") {
            dispatch.max_job_attempts = n;
        }
        if let Some(ms) = env_parse("FLEET_RETRY_BACKOFF_MS") {
            dispatch.retry_backoff = Duration::from_millis(ms);
        }

        Self {
            data_dir,
            server,
            registry,
            dispatch,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
