//! Per-job status channels
//!
//! Each live entry gets one spawned channel task that normalizes server
//! status into [`ChannelEvent`]s for the manager, over one of two
//! interchangeable transports:
//!
//! - **Push** consumes the NDJSON event stream. A transport drop (stream
//!   error, or EOF before a terminal event) schedules a re-subscription
//!   after the reconnect delay. Malformed lines are logged and discarded.
//! - **Poll** fetches the status record on a fixed interval, suppresses
//!   unchanged payloads, and synthesizes a terminal error once the
//!   inactivity window elapses with no change. Fetch failures are absorbed
//!   until the next tick.
//!
//! Neither transport ever turns a transport failure into a job failure;
//! only an explicit error payload (or the inactivity heuristic) does that.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use downbeat_server_client::{
    ClientError, DownloadsClient, ItemType, StatusKind, StatusPayload, StreamEvent,
};

use crate::task::TaskId;

/// Status transport strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Server-sent NDJSON event stream
    Push,
    /// Periodic status fetch
    Poll,
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" | "stream" => Ok(Transport::Push),
            "poll" | "polling" => Ok(Transport::Poll),
            other => anyhow::bail!("unknown transport '{other}' (expected push or poll)"),
        }
    }
}

/// Channel timing configuration, carved out of the queue config
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub transport: Transport,
    pub poll_interval: Duration,
    pub inactivity_timeout: Duration,
    pub reconnect_delay: Duration,
}

/// Event emitted by a channel task
#[derive(Debug)]
pub struct ChannelEvent {
    pub id: TaskId,
    pub kind: ChannelEventKind,
}

#[derive(Debug)]
pub enum ChannelEventKind {
    /// A (possibly synthesized) status event for the entry
    Event(StreamEvent),
    /// The channel task exited; its admission slot is free
    Closed,
}

/// Handle to one running channel task
#[derive(Debug)]
pub struct ChannelHandle {
    token: CancellationToken,
    _join: JoinHandle<()>,
}

impl ChannelHandle {
    /// Ask the task to stop. The admission slot stays occupied until the
    /// task's `Closed` event arrives.
    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Spawn a status channel for one entry
///
/// `seed` is the entry's current last payload, so duplicate suppression
/// carries across channel restarts (window rotation, reconnects).
pub fn spawn(
    client: DownloadsClient,
    config: ChannelConfig,
    id: TaskId,
    handle: String,
    item_type: ItemType,
    seed: Option<StatusPayload>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> ChannelHandle {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let join = tokio::spawn(async move {
        match config.transport {
            Transport::Push => {
                run_push(client, config, id, &handle, item_type, seed, &events, &task_token).await
            }
            Transport::Poll => {
                run_poll(client, config, id, &handle, seed, &events, &task_token).await
            }
        }
        let _ = events.send(ChannelEvent {
            id,
            kind: ChannelEventKind::Closed,
        });
    });
    ChannelHandle { token, _join: join }
}

/// Whether this event ends the stream for good
fn is_terminal_for(event: &StreamEvent, item_type: ItemType) -> bool {
    match event {
        StreamEvent::Done { .. } | StreamEvent::Error { .. } => true,
        StreamEvent::TrackComplete { .. } => item_type == ItemType::Track,
        StreamEvent::End { payload } => payload.status.is_terminal(),
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_push(
    client: DownloadsClient,
    config: ChannelConfig,
    id: TaskId,
    handle: &str,
    item_type: ItemType,
    mut last_payload: Option<StatusPayload>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    token: &CancellationToken,
) {
    use futures_util::StreamExt;

    loop {
        if token.is_cancelled() {
            return;
        }

        match client.events(handle).await {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        if let Some(payload) = event.payload() {
                            if last_payload.as_ref() == Some(payload) {
                                continue;
                            }
                            last_payload = Some(payload.clone());
                        }
                        let terminal = is_terminal_for(&event, item_type);
                        let _ = events.send(ChannelEvent {
                            id,
                            kind: ChannelEventKind::Event(event),
                        });
                        if terminal {
                            return;
                        }
                    }
                    Some(Err(e)) if e.is_protocol() => {
                        warn!(handle, error = %e, "discarding malformed status event");
                    }
                    Some(Err(e)) => {
                        debug!(handle, error = %e, "status stream transport error");
                        break;
                    }
                    // EOF before a terminal event is a transport-level drop
                    None => {
                        debug!(handle, "status stream closed early");
                        break;
                    }
                }
            },
            Err(e) => {
                debug!(handle, error = %e, "status stream subscription failed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

async fn run_poll(
    client: DownloadsClient,
    config: ChannelConfig,
    id: TaskId,
    handle: &str,
    mut last_payload: Option<StatusPayload>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    token: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_change = Instant::now();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match client.status(handle).await {
            Ok(record) => match record.last_status {
                Some(payload) if last_payload.as_ref() != Some(&payload) => {
                    last_change = Instant::now();
                    last_payload = Some(payload.clone());
                    let terminal = payload.status.is_terminal();
                    let _ = events.send(ChannelEvent {
                        id,
                        kind: ChannelEventKind::Event(normalize_poll(payload)),
                    });
                    if terminal {
                        return;
                    }
                }
                _ => {
                    if last_change.elapsed() >= config.inactivity_timeout {
                        warn!(handle, "no status change within inactivity window");
                        let _ = events.send(ChannelEvent {
                            id,
                            kind: ChannelEventKind::Event(StreamEvent::Error {
                                payload: StatusPayload::of(StatusKind::Error)
                                    .with_message("inactivity timeout"),
                            }),
                        });
                        return;
                    }
                }
            },
            Err(ClientError::HandleNotFound(_)) => {
                // The record can lag or get swept server-side; the
                // inactivity window decides when to give up
                debug!(handle, "status record missing");
            }
            Err(e) if e.is_transport() => {
                debug!(handle, error = %e, "status fetch failed, absorbed until next tick");
            }
            Err(e) => {
                warn!(handle, error = %e, "discarding malformed status record");
            }
        }
    }
}

/// Shape one polled payload into the stream event vocabulary
fn normalize_poll(payload: StatusPayload) -> StreamEvent {
    match payload.status {
        StatusKind::Done => StreamEvent::Done { payload },
        StatusKind::Error => StreamEvent::Error { payload },
        StatusKind::Cancelled | StatusKind::Interrupted => StreamEvent::End { payload },
        _ => StreamEvent::Update { payload },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downbeat_test_utils::{events as ev, JobFixture, MockDownloadServer};
    use uuid::Uuid;

    fn config(transport: Transport) -> ChannelConfig {
        ChannelConfig {
            transport,
            poll_interval: Duration::from_millis(20),
            inactivity_timeout: Duration::from_millis(150),
            reconnect_delay: Duration::from_millis(30),
        }
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Option<ChannelEventKind> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
            .map(|e| e.kind)
    }

    #[tokio::test]
    async fn push_forwards_events_until_terminal() {
        let server = MockDownloadServer::start().await;
        server
            .mock_events(
                "trk_1",
                vec![ev::update("downloading"), ev::progress(80.0), ev::done()],
            )
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            client,
            config(Transport::Push),
            Uuid::new_v4(),
            "trk_1".to_string(),
            ItemType::Track,
            None,
            tx,
        );

        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Update { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Progress { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Done { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Closed)
        ));
        // Terminal event: no reconnect
        assert_eq!(server.stream_count("trk_1").await, 1);
    }

    #[tokio::test]
    async fn push_reconnects_after_early_stream_close() {
        let server = MockDownloadServer::start().await;
        server
            .mock_events_once("alb_1", vec![ev::update("downloading")])
            .await;
        server.mock_events("alb_1", vec![ev::done()]).await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            client,
            config(Transport::Push),
            Uuid::new_v4(),
            "alb_1".to_string(),
            ItemType::Album,
            None,
            tx,
        );

        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Update { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Done { .. }))
        ));
        assert!(server.stream_count("alb_1").await >= 2);
    }

    #[tokio::test]
    async fn push_suppresses_duplicate_payloads() {
        let server = MockDownloadServer::start().await;
        server
            .mock_events(
                "trk_1",
                vec![ev::update("downloading"), ev::update("downloading"), ev::done()],
            )
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            client,
            config(Transport::Push),
            Uuid::new_v4(),
            "trk_1".to_string(),
            ItemType::Track,
            None,
            tx,
        );

        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Update { .. }))
        ));
        // The duplicate update is swallowed; next is the terminal
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Done { .. }))
        ));
    }

    #[tokio::test]
    async fn track_complete_ends_the_stream_for_track_jobs_only() {
        let server = MockDownloadServer::start().await;
        server
            .mock_events("trk_1", vec![ev::track_complete("Song", 1, 1)])
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            client,
            config(Transport::Push),
            Uuid::new_v4(),
            "trk_1".to_string(),
            ItemType::Track,
            None,
            tx,
        );

        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::TrackComplete { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Closed)
        ));
    }

    #[tokio::test]
    async fn poll_emits_changes_and_terminal() {
        let server = MockDownloadServer::start().await;
        server
            .mock_status(
                "trk_1",
                JobFixture::track("trk_1", "spotify:track:1")
                    .with_status(ev::payload("done"))
                    .record_json(),
            )
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            client,
            config(Transport::Poll),
            Uuid::new_v4(),
            "trk_1".to_string(),
            ItemType::Track,
            None,
            tx,
        );

        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Event(StreamEvent::Done { .. }))
        ));
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Closed)
        ));
    }

    #[tokio::test]
    async fn poll_synthesizes_inactivity_timeout() {
        let server = MockDownloadServer::start().await;
        server
            .mock_status(
                "stuck",
                JobFixture::track("stuck", "spotify:track:1")
                    .with_status(ev::payload("downloading"))
                    .record_json(),
            )
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seed = Some(StatusPayload::of(StatusKind::Downloading));
        let _handle = spawn(
            client,
            config(Transport::Poll),
            Uuid::new_v4(),
            "stuck".to_string(),
            ItemType::Track,
            seed,
            tx,
        );

        match recv_event(&mut rx).await {
            Some(ChannelEventKind::Event(StreamEvent::Error { payload })) => {
                assert_eq!(payload.message.as_deref(), Some("inactivity timeout"));
            }
            other => panic!("expected inactivity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_stops_the_task_and_reports_closed() {
        let server = MockDownloadServer::start().await;
        server
            .mock_status(
                "slow",
                JobFixture::track("slow", "spotify:track:1").record_json(),
            )
            .await;

        let client = DownloadsClient::new(&server.url()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(
            client,
            config(Transport::Poll),
            Uuid::new_v4(),
            "slow".to_string(),
            ItemType::Track,
            None,
            tx,
        );

        handle.close();
        assert!(matches!(
            recv_event(&mut rx).await,
            Some(ChannelEventKind::Closed)
        ));
    }
}
