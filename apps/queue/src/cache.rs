//! Durable local state cache
//!
//! Replaces the browser-local storage of a web client with a typed
//! key-value contract over a JSON file: per-handle last status payloads
//! (plus the retry count, so startup reconciliation can tell an exhausted
//! error from a retryable one), the visible-window size, and the panel-open
//! flag. Absent or corrupt state loads as empty; the cache is never a
//! source of hard failures.
//!
//! The manager is the single writer. Writes go through [`CacheWriter`],
//! which coalesces bursts into one persist per debounce window and flushes
//! the last pending snapshot when dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use downbeat_server_client::StatusPayload;

use crate::error::QueueResult;

/// Cached record for one job handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTask {
    /// Last status payload seen for the handle
    pub payload: StatusPayload,

    /// Retries spent on the logical job owning the handle
    #[serde(default)]
    pub retry_count: u32,
}

/// The full durable state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Per-handle cached task state
    #[serde(default)]
    pub tasks: HashMap<String, CachedTask>,

    /// Persisted visible-window size, if the user ever changed it
    #[serde(default)]
    pub visible_window: Option<usize>,

    /// Persisted panel-open preference
    #[serde(default)]
    pub panel_open: Option<bool>,
}

/// Typed persistence contract for the durable state
///
/// The file-backed [`FileStore`] is the production implementation; tests
/// substitute in-memory stores.
pub trait StateStore: Send + Sync {
    /// Load the last persisted snapshot. Missing or corrupt state yields an
    /// empty snapshot, not an error.
    fn load(&self) -> QueueResult<CacheSnapshot>;

    /// Persist a snapshot atomically.
    fn persist(&self, snapshot: &CacheSnapshot) -> QueueResult<()>;
}

/// JSON-file-backed state store
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for FileStore {
    fn load(&self) -> QueueResult<CacheSnapshot> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheSnapshot::default())
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state cache corrupt, starting empty");
                Ok(CacheSnapshot::default())
            }
        }
    }

    fn persist(&self, snapshot: &CacheSnapshot) -> QueueResult<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        // Write-then-rename keeps a crash from truncating the cache
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Handle feeding snapshots to the debounced writer task
///
/// Dropping the writer flushes the last pending snapshot before the task
/// exits, which doubles as the shutdown flush.
#[derive(Debug)]
pub struct CacheWriter {
    tx: mpsc::UnboundedSender<CacheSnapshot>,
}

impl CacheWriter {
    /// Spawn the writer task
    pub fn spawn(store: Arc<dyn StateStore>, debounce: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(write_loop(store, rx, debounce));
        (Self { tx }, join)
    }

    /// Queue a snapshot for persistence
    pub fn push(&self, snapshot: CacheSnapshot) {
        // A closed writer means shutdown is already past the flush
        let _ = self.tx.send(snapshot);
    }
}

async fn write_loop(
    store: Arc<dyn StateStore>,
    mut rx: mpsc::UnboundedReceiver<CacheSnapshot>,
    debounce: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut latest = first;
        let window = tokio::time::sleep(debounce);
        tokio::pin!(window);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut window => break,
                next = rx.recv() => match next {
                    Some(snapshot) => latest = snapshot,
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }
        if let Err(e) = store.persist(&latest) {
            warn!(error = %e, "state cache write failed");
        } else {
            debug!(tasks = latest.tasks.len(), "state cache written");
        }
        if closed {
            return;
        }
    }
}
