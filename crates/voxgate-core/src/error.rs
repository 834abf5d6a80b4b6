//! Error types for voxgate.

use thiserror::Error;

use crate::types::LockHolder;

/// Result type alias using voxgate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for voxgate.
#[derive(Error, Debug)]
pub enum Error {
    // Session errors
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Session busy: {holder} session in progress")]
    SessionBusy { holder: LockHolder },

    #[error("Sink failure: {0}")]
    SinkFailure(String),

    #[error("Sink not ready: previous append still in flight")]
    NotReady,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Stale completion for session generation {generation}")]
    StaleCompletion { generation: u64 },

    // Audio errors
    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("Network error: {0}")]
    Network(String),

    // Host errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Coordinator has shut down")]
    Shutdown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if the request was refused because another session holds the lock.
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::SessionBusy { .. })
    }

    /// Returns true if an input or output device failed.
    pub const fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::SinkFailure(_) | Self::AudioDecode(_)
        )
    }
}
