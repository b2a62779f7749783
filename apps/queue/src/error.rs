//! Queue subsystem error types
//!
//! Job failure is deliberately not represented here: a job that fails is
//! data (a terminal error status on its [`crate::task::TaskEntry`]), not an
//! `Err`. These variants cover the subsystem's own plumbing.

use thiserror::Error;

/// Errors produced by the queue subsystem
#[derive(Error, Debug)]
pub enum QueueError {
    /// State cache could not be read or written
    #[error("state cache I/O: {0}")]
    CacheIo(#[from] std::io::Error),

    /// State cache contents could not be serialized
    #[error("state cache serialization: {0}")]
    CacheFormat(#[from] serde_json::Error),

    /// A server call failed
    #[error(transparent)]
    Client(#[from] downbeat_server_client::ClientError),

    /// The manager task is no longer running
    #[error("queue manager has shut down")]
    ManagerClosed,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
