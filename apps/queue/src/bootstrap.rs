//! Startup reconciliation against the remote job list
//!
//! Runs once before the manager loop: the remote outstanding-job list is
//! authoritative, the local cache only enriches it. Terminal leftovers are
//! garbage-collected (best-effort remote delete, cache purge) instead of
//! being re-displayed; everything else is reconstructed from the
//! server-echoed original request so labels and retry descriptors survive a
//! restart.

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use downbeat_server_client::{ClientError, DownloadsClient, StatusKind, StatusRecord};

use crate::cache::CacheSnapshot;
use crate::error::QueueResult;
use crate::retry::RetryPolicy;
use crate::task::TaskEntry;

/// Reconcile local state with the remote job list
///
/// Returns the entries to register and the pruned cache snapshot the
/// manager should start from.
pub async fn bootstrap(
    client: &DownloadsClient,
    mut cache: CacheSnapshot,
    policy: &RetryPolicy,
    concurrency: usize,
) -> QueueResult<(Vec<TaskEntry>, CacheSnapshot)> {
    let handles = client.list().await?;
    info!(outstanding = handles.len(), "reconciling remote job list");

    // Cached handles with no remote record are stale
    cache.tasks.retain(|handle, _| {
        let listed = handles.iter().any(|h| h == handle);
        if !listed {
            debug!(%handle, "dropping cache entry with no remote record");
        }
        listed
    });

    let statuses: Vec<(String, Result<StatusRecord, ClientError>)> =
        stream::iter(handles.into_iter())
            .map(|handle| async move {
                let record = client.status(&handle).await;
                (handle, record)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    let mut entries = Vec::new();
    for (handle, record) in statuses {
        let record = match record {
            Ok(record) => record,
            Err(ClientError::HandleNotFound(_)) => {
                cache.tasks.remove(&handle);
                continue;
            }
            Err(e) => {
                // Leave the job alone; the next startup sees it again
                warn!(%handle, error = %e, "status fetch failed, skipping job");
                continue;
            }
        };

        let cached = cache.tasks.get(&handle);
        let retry_count = cached.map(|c| c.retry_count).unwrap_or(0);
        let status = record
            .last_status
            .as_ref()
            .or(cached.map(|c| &c.payload))
            .map(|p| p.status);

        if is_stale(status, retry_count, policy) {
            debug!(%handle, ?status, "pruning terminal job");
            if let Err(e) = client.delete(&handle).await {
                warn!(%handle, error = %e, "remote delete failed");
            }
            cache.tasks.remove(&handle);
            continue;
        }

        let cached_payload = cached.map(|c| c.payload.clone());
        entries.push(TaskEntry::from_remote(
            &handle,
            record,
            cached_payload,
            retry_count,
        ));
    }

    info!(restored = entries.len(), "startup reconciliation done");
    Ok((entries, cache))
}

/// Terminal records are pruned; an error still holding retry budget is
/// restored as a retryable entry instead
fn is_stale(status: Option<StatusKind>, retry_count: u32, policy: &RetryPolicy) -> bool {
    match status {
        Some(StatusKind::Done) | Some(StatusKind::Cancelled) | Some(StatusKind::Interrupted) => {
            true
        }
        Some(StatusKind::Error) => !policy.retries_remain(retry_count),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedTask;
    use downbeat_server_client::{RetrySettings, StatusPayload};
    use downbeat_test_utils::{events as ev, JobFixture, MockDownloadServer};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetrySettings::default())
    }

    fn cache_with(handle: &str, status: StatusKind, retry_count: u32) -> CacheSnapshot {
        let mut cache = CacheSnapshot::default();
        cache.tasks.insert(
            handle.to_string(),
            CachedTask {
                payload: StatusPayload::of(status),
                retry_count,
            },
        );
        cache
    }

    #[tokio::test]
    async fn prunes_terminal_jobs_and_deletes_their_records() {
        let server = MockDownloadServer::start().await;
        server.mock_list(&["done_1", "live_1"]).await;
        server
            .mock_status(
                "done_1",
                JobFixture::track("done_1", "spotify:track:1")
                    .with_status(ev::payload("done"))
                    .record_json(),
            )
            .await;
        server
            .mock_status(
                "live_1",
                JobFixture::album("live_1", "spotify:album:1")
                    .with_labels("Opera", "Queen")
                    .with_status(ev::payload("downloading"))
                    .record_json(),
            )
            .await;
        server.mock_delete("done_1").await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (entries, cache) = bootstrap(&client, CacheSnapshot::default(), &policy(), 2)
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].handle, "live_1");
        assert_eq!(entries[0].display_name.as_deref(), Some("Opera"));
        assert_eq!(server.delete_count("done_1").await, 1);
        assert!(cache.tasks.is_empty());
    }

    #[tokio::test]
    async fn exhausted_errors_are_pruned_but_retryable_ones_restored() {
        let server = MockDownloadServer::start().await;
        server.mock_list(&["spent", "retryable"]).await;
        server
            .mock_status(
                "spent",
                JobFixture::album("spent", "spotify:album:1")
                    .with_status(ev::payload_with_message("error", "gave up"))
                    .record_json(),
            )
            .await;
        server
            .mock_status(
                "retryable",
                JobFixture::album("retryable", "spotify:album:2")
                    .with_status(ev::payload_with_message("error", "network"))
                    .record_json(),
            )
            .await;
        server.mock_delete("spent").await;

        let mut cache = cache_with("spent", StatusKind::Error, 3);
        cache.tasks.extend(
            cache_with("retryable", StatusKind::Error, 1).tasks,
        );

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (entries, cache) = bootstrap(&client, cache, &policy(), 2).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].handle, "retryable");
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(server.delete_count("spent").await, 1);
        assert!(!cache.tasks.contains_key("spent"));
    }

    #[tokio::test]
    async fn cached_handles_without_remote_records_are_purged() {
        let server = MockDownloadServer::start().await;
        server.mock_list(&[]).await;

        let cache = cache_with("ghost", StatusKind::Downloading, 0);
        let client = DownloadsClient::new(&server.url()).unwrap();
        let (entries, cache) = bootstrap(&client, cache, &policy(), 2).await.unwrap();

        assert!(entries.is_empty());
        assert!(cache.tasks.is_empty());
    }

    #[tokio::test]
    async fn cached_payload_seeds_the_restored_entry() {
        let server = MockDownloadServer::start().await;
        server.mock_list(&["quiet"]).await;
        // Remote record carries no payload yet
        server
            .mock_status(
                "quiet",
                JobFixture::track("quiet", "spotify:track:7").record_json(),
            )
            .await;

        let mut cache = CacheSnapshot::default();
        cache.tasks.insert(
            "quiet".to_string(),
            CachedTask {
                payload: StatusPayload::of(StatusKind::Downloading).with_message("7 of 12"),
                retry_count: 0,
            },
        );

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (entries, _) = bootstrap(&client, cache, &policy(), 2).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_message(), Some("7 of 12"));
    }

    #[tokio::test]
    async fn listed_job_whose_record_vanished_is_dropped() {
        let server = MockDownloadServer::start().await;
        server.mock_list(&["gone"]).await;
        server.mock_status_missing("gone").await;

        let cache = cache_with("gone", StatusKind::Downloading, 0);
        let client = DownloadsClient::new(&server.url()).unwrap();
        let (entries, cache) = bootstrap(&client, cache, &policy(), 2).await.unwrap();

        assert!(entries.is_empty());
        assert!(cache.tasks.is_empty());
    }
}
