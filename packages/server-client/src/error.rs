//! Download server API error types

use thiserror::Error;

/// Errors produced by the download server client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Server base URL failed to parse
    #[error("invalid server URL: {0}")]
    InvalidBaseUrl(String),

    /// HTTP request failed at the transport level
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body was not the expected shape
    #[error("failed to parse server response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Server rejected the request
    #[error("server returned {status}: {body}")]
    Api { status: u16, body: String },

    /// No job record exists for the handle
    #[error("no job record for handle {0}")]
    HandleNotFound(String),

    /// Request timed out
    #[error("request to download server timed out")]
    Timeout,
}

impl ClientError {
    /// Whether this is a transport-level failure
    ///
    /// Transport failures never mark a job as failed: the channel layer
    /// reconnects (push) or waits for the next tick (poll). Server errors
    /// (5xx) count as transport because the job record itself is unaffected.
    pub fn is_transport(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            ClientError::Api { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Whether this is a malformed-payload failure
    ///
    /// Protocol failures are logged and discarded without advancing job
    /// state.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Parse(_))
    }
}

/// Result type for download server operations
pub type ClientResult<T> = Result<T, ClientError>;
