//! Queue configuration loaded from environment variables
//!
//! Every timing knob the protocol leaves to the client (poll interval,
//! inactivity window, reconnect delay, cleanup grace, cache debounce) is
//! configuration with the documented default, not a hardcoded constant.
//! Retry backoff is not here: those settings come from the server.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::channel::Transport;

/// Queue service configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Download server base URL
    pub server_url: String,

    /// Status transport strategy (push stream or polling)
    pub transport: Transport,

    /// Maximum simultaneously open status channels
    pub connection_cap: usize,

    /// Default visible-window size (a persisted preference overrides this)
    pub visible_window: usize,

    /// Increment applied when the user expands the window
    pub window_step: usize,

    /// Poll transport fetch interval
    pub poll_interval: Duration,

    /// Silence window after which a poll channel declares the job dead
    pub inactivity_timeout: Duration,

    /// Delay before a push channel re-subscribes after a transport drop
    pub reconnect_delay: Duration,

    /// Grace period between a terminal success/cancellation and cleanup
    pub cleanup_grace: Duration,

    /// Path of the durable state cache file
    pub cache_path: PathBuf,

    /// Coalescing window for state cache writes
    pub cache_debounce: Duration,

    /// Concurrent status fetches during startup reconciliation
    pub bootstrap_concurrency: usize,
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_url: env::var("DOWNBEAT_SERVER_URL")
                .unwrap_or_else(|_| "http://localhost:7480".to_string()),

            transport: Transport::from_str(
                &env::var("DOWNBEAT_TRANSPORT").unwrap_or_else(|_| "push".to_string()),
            )
            .context("Invalid DOWNBEAT_TRANSPORT value")?,

            connection_cap: env::var("DOWNBEAT_CONNECTION_CAP")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid DOWNBEAT_CONNECTION_CAP value")?,

            visible_window: env::var("DOWNBEAT_VISIBLE_WINDOW")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DOWNBEAT_VISIBLE_WINDOW value")?,

            window_step: env::var("DOWNBEAT_WINDOW_STEP")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DOWNBEAT_WINDOW_STEP value")?,

            poll_interval: secs_var("DOWNBEAT_POLL_INTERVAL", 2)?,

            inactivity_timeout: secs_var("DOWNBEAT_INACTIVITY_TIMEOUT", 300)?,

            reconnect_delay: secs_var("DOWNBEAT_RECONNECT_DELAY", 5)?,

            cleanup_grace: secs_var("DOWNBEAT_CLEANUP_GRACE", 5)?,

            cache_path: env::var("DOWNBEAT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("downbeat-state.json")),

            cache_debounce: millis_var("DOWNBEAT_CACHE_DEBOUNCE_MS", 500)?,

            bootstrap_concurrency: env::var("DOWNBEAT_BOOTSTRAP_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid DOWNBEAT_BOOTSTRAP_CONCURRENCY value")?,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:7480".to_string(),
            transport: Transport::Push,
            connection_cap: 5,
            visible_window: 10,
            window_step: 10,
            poll_interval: Duration::from_secs(2),
            inactivity_timeout: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(5),
            cleanup_grace: Duration::from_secs(5),
            cache_path: PathBuf::from("downbeat-state.json"),
            cache_debounce: Duration::from_millis(500),
            bootstrap_concurrency: 4,
        }
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("Invalid {name} value"))?;
    Ok(Duration::from_secs(secs))
}

fn millis_var(name: &str, default: u64) -> Result<Duration> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let millis: u64 = raw
        .parse()
        .with_context(|| format!("Invalid {name} value"))?;
    Ok(Duration::from_millis(millis))
}
