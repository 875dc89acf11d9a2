//! Error types for the fleet gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fleet gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unknown wire message; the connection stays open
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registration rejected (missing or empty uuid)
    #[error("registration error: {0}")]
    Registration(String),

    /// Heartbeat or result from a connection with no active binding
    #[error("device not registered")]
    UnregisteredDevice,

    /// Unexpected failure while processing a command job
    #[error("command execution error: {0}")]
    CommandExecution(String),

    /// Dispatch queue error
    #[error("queue error: {0}")]
    Queue(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable message safe to send across the device-facing boundary
    ///
    /// Internal detail (SQL text, paths) never leaves the process; devices
    /// see only the stable keyed form.
    #[must_use]
    pub fn device_message(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "invalid message",
            Self::Registration(_) => "uuid is required",
            Self::UnregisteredDevice => "device not registered",
            _ => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_message_is_stable() {
        let err = Error::Database("SELECT blew up at /var/lib/fleet.db".to_string());
        assert_eq!(err.device_message(), "internal error");

        let err = Error::Registration("empty uuid".to_string());
        assert_eq!(err.device_message(), "uuid is required");

        assert_eq!(
            Error::UnregisteredDevice.device_message(),
            "device not registered"
        );
    }
}
