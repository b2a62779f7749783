//! Common test harness for queue integration tests
//!
//! Provides an in-memory state store, millisecond-scale timing config, and
//! helpers for spawning a manager against a [`MockDownloadServer`].

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use downbeat_queue::{
    CacheSnapshot, QueueConfig, QueueHandle, QueueManager, QueueResult, RetryPolicy, StateStore,
    TaskEntry, TaskSnapshot, Transport,
};
use downbeat_server_client::{DownloadsClient, RetrySettings};
use downbeat_test_utils::MockDownloadServer;

/// In-memory state store observable from tests
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<CacheSnapshot>,
}

impl MemoryStore {
    pub fn with(snapshot: CacheSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn current(&self) -> CacheSnapshot {
        self.snapshot.lock().unwrap().clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> QueueResult<CacheSnapshot> {
        Ok(self.current())
    }

    fn persist(&self, snapshot: &CacheSnapshot) -> QueueResult<()> {
        *self.snapshot.lock().unwrap() = snapshot.clone();
        Ok(())
    }
}

/// Millisecond-scale timings so scenarios finish fast
pub fn fast_config(server_url: &str, transport: Transport) -> QueueConfig {
    QueueConfig {
        server_url: server_url.to_string(),
        transport,
        connection_cap: 5,
        visible_window: 10,
        window_step: 10,
        poll_interval: Duration::from_millis(20),
        inactivity_timeout: Duration::from_millis(400),
        reconnect_delay: Duration::from_millis(30),
        cleanup_grace: Duration::from_millis(60),
        cache_path: "unused-in-tests.json".into(),
        cache_debounce: Duration::from_millis(10),
        bootstrap_concurrency: 4,
    }
}

/// Zero-delay retries with the default budget of 3
pub fn instant_retries() -> RetrySettings {
    RetrySettings {
        max_retries: 3,
        retry_delay_secs: 0,
        retry_delay_increase_secs: 0,
    }
}

pub struct Harness {
    pub handle: QueueHandle,
    pub store: Arc<MemoryStore>,
    pub manager: tokio::task::JoinHandle<()>,
}

/// Spawn a manager with default fast config and no restored entries
pub async fn spawn_queue(server: &MockDownloadServer, transport: Transport) -> Harness {
    spawn_queue_with(
        fast_config(&server.url(), transport),
        instant_retries(),
        CacheSnapshot::default(),
        Vec::new(),
    )
    .await
}

/// Spawn a manager with explicit config, settings, cache and entries
pub async fn spawn_queue_with(
    config: QueueConfig,
    settings: RetrySettings,
    cached: CacheSnapshot,
    restored: Vec<TaskEntry>,
) -> Harness {
    let client = DownloadsClient::new(&config.server_url).unwrap();
    let store = Arc::new(MemoryStore::with(cached.clone()));
    let (mut manager, handle) = QueueManager::new(
        config,
        client,
        RetryPolicy::new(settings),
        store.clone(),
        cached,
    );
    manager.restore(restored);
    let manager = tokio::spawn(manager.run());
    Harness {
        handle,
        store,
        manager,
    }
}

/// Poll snapshots until `pred` holds, panicking after 5 seconds
pub async fn wait_for<F>(handle: &QueueHandle, mut pred: F) -> Vec<TaskSnapshot>
where
    F: FnMut(&[TaskSnapshot]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.expect("manager alive");
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time; last snapshot: {snapshot:#?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
