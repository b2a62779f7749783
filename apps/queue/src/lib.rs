//! Downbeat download queue and job-tracking subsystem
//!
//! Tracks long-running, server-executed media download jobs from submission
//! to completion:
//!
//! - [`manager::QueueManager`] owns the tracked entries, orders them for
//!   display, caps simultaneously live status channels, drives retries and
//!   cleanup, and is the single writer of the durable state cache
//! - [`channel`] subscribes to per-job status over a push event stream or a
//!   polling fallback, behind one interface
//! - [`retry::RetryPolicy`] applies the server-supplied linear backoff
//! - [`cache`] persists per-handle status and UI preferences across restarts
//! - [`bootstrap`] reconciles local state against the authoritative remote
//!   job list at startup
//!
//! The manager is an explicitly constructed, long-lived service: build it at
//! the composition root, keep the [`manager::QueueHandle`], and subscribe
//! renderers to the [`manager::QueueEvent`] feed.

pub mod bootstrap;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod retry;
pub mod task;

pub use bootstrap::bootstrap;
pub use cache::{CacheSnapshot, CachedTask, CacheWriter, FileStore, StateStore};
pub use channel::Transport;
pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use manager::{QueueEvent, QueueHandle, QueueManager, TaskSnapshot};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{TaskEntry, TaskId, TaskState};
