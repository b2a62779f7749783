//! Mock download server for queue and client tests
//!
//! Wraps a [`wiremock::MockServer`] with convenience mounts for every job
//! API endpoint, so tests can script submissions, status records, event
//! streams and cancellation outcomes without a real server.

use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock download server
///
/// # Example
///
/// ```rust,ignore
/// use downbeat_test_utils::{events, MockDownloadServer};
///
/// #[tokio::test]
/// async fn submits_and_completes() {
///     let server = MockDownloadServer::start().await;
///     server.mock_submit_single("trk_1").await;
///     server
///         .mock_events(
///             "trk_1",
///             vec![events::update("downloading"), events::done()],
///         )
///         .await;
///
///     // Point your DownloadsClient at server.url()
/// }
/// ```
pub struct MockDownloadServer {
    server: MockServer,
}

impl MockDownloadServer {
    /// Start a new mock server
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Get the server URL
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Access the underlying wiremock server for custom mounts
    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// Mount retry settings
    pub async fn mock_settings(&self, max_retries: u32, delay_secs: u64, increase_secs: u64) {
        Mock::given(method("GET"))
            .and(path("/api/settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "max_retries": max_retries,
                "retry_delay_secs": delay_secs,
                "retry_delay_increase_secs": increase_secs,
            })))
            .mount(&self.server)
            .await;
    }

    /// Mount a submission response with a single handle
    pub async fn mock_submit_single(&self, handle: &str) {
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handle": handle})))
            .mount(&self.server)
            .await;
    }

    /// Mount a single-handle submission response that matches exactly once
    ///
    /// Mount these in submission order to script retry resubmissions that
    /// must yield fresh handles.
    pub async fn mock_submit_single_once(&self, handle: &str) {
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handle": handle})))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
    }

    /// Mount an artist fan-out submission response
    pub async fn mock_submit_fanout(&self, handles: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handles": handles})))
            .mount(&self.server)
            .await;
    }

    /// Mount a failing submission response
    pub async fn mock_submit_error(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(status).set_body_string("submission refused"))
            .mount(&self.server)
            .await;
    }

    /// Mount a status record for one handle
    pub async fn mock_status(&self, handle: &str, record: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/downloads/{handle}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(record))
            .mount(&self.server)
            .await;
    }

    /// Mount a missing status record for one handle
    pub async fn mock_status_missing(&self, handle: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/api/downloads/{handle}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;
    }

    /// Mount an event stream delivering the given events as NDJSON
    pub async fn mock_events(&self, handle: &str, events: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path(format!("/api/downloads/{handle}/events")))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ndjson(&events), "application/x-ndjson"),
            )
            .mount(&self.server)
            .await;
    }

    /// Mount an event stream that matches exactly once
    ///
    /// Mount in order to script reconnects: the first subscription consumes
    /// this mount, later ones fall through to the next.
    pub async fn mock_events_once(&self, handle: &str, events: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path(format!("/api/downloads/{handle}/events")))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ndjson(&events), "application/x-ndjson"),
            )
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
    }

    /// Mount an event stream whose response is delayed
    ///
    /// Useful for holding a channel open while asserting on admission
    /// control: the subscription stays in flight for `delay`.
    pub async fn mock_events_slow(&self, handle: &str, events: Vec<Value>, delay: Duration) {
        Mock::given(method("GET"))
            .and(path(format!("/api/downloads/{handle}/events")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(delay)
                    .set_body_raw(ndjson(&events), "application/x-ndjson"),
            )
            .mount(&self.server)
            .await;
    }

    /// Mount a confirming cancel endpoint
    pub async fn mock_cancel_ok(&self, handle: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/downloads/{handle}/cancel")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cancelled": true})))
            .mount(&self.server)
            .await;
    }

    /// Mount a failing cancel endpoint
    pub async fn mock_cancel_fail(&self, handle: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(format!("/api/downloads/{handle}/cancel")))
            .respond_with(ResponseTemplate::new(status).set_body_string("cannot cancel"))
            .mount(&self.server)
            .await;
    }

    /// Mount a delete endpoint
    pub async fn mock_delete(&self, handle: &str) {
        Mock::given(method("DELETE"))
            .and(path(format!("/api/downloads/{handle}")))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    /// Mount the outstanding-handle listing
    pub async fn mock_list(&self, handles: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(handles)))
            .mount(&self.server)
            .await;
    }

    /// Count DELETE requests received for one handle
    pub async fn delete_count(&self, handle: &str) -> usize {
        let target = format!("/api/downloads/{handle}");
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.to_string() == "DELETE" && r.url.path() == target)
            .count()
    }

    /// Count cancel requests received for one handle
    pub async fn cancel_count(&self, handle: &str) -> usize {
        let target = format!("/api/downloads/{handle}/cancel");
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.to_string() == "POST" && r.url.path() == target)
            .count()
    }

    /// Count event stream subscriptions received for one handle
    pub async fn stream_count(&self, handle: &str) -> usize {
        let target = format!("/api/downloads/{handle}/events");
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.to_string() == "GET" && r.url.path() == target)
            .count()
    }

    /// Count submissions received
    pub async fn submit_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.to_string() == "POST" && r.url.path() == "/api/downloads")
            .count()
    }
}

fn ndjson(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&event.to_string());
        body.push('\n');
    }
    body
}

/// A job record fixture for status endpoints
#[derive(Debug, Clone)]
pub struct JobFixture {
    pub handle: String,
    pub item_type: String,
    pub url: String,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub last_status: Option<Value>,
}

impl JobFixture {
    pub fn new(handle: &str, item_type: &str, url: &str) -> Self {
        Self {
            handle: handle.to_string(),
            item_type: item_type.to_string(),
            url: url.to_string(),
            name: None,
            artist: None,
            last_status: None,
        }
    }

    pub fn track(handle: &str, url: &str) -> Self {
        Self::new(handle, "track", url)
    }

    pub fn album(handle: &str, url: &str) -> Self {
        Self::new(handle, "album", url)
    }

    pub fn with_labels(mut self, name: &str, artist: &str) -> Self {
        self.name = Some(name.to_string());
        self.artist = Some(artist.to_string());
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.last_status = Some(status);
        self
    }

    /// Build the status record body the server returns for this job
    pub fn record_json(&self) -> Value {
        let mut original = json!({
            "url": self.url,
            "item_type": self.item_type,
        });
        if let Some(name) = &self.name {
            original["name"] = json!(name);
        }
        if let Some(artist) = &self.artist {
            original["artist"] = json!(artist);
        }
        json!({
            "item_type": self.item_type,
            "original_request": original,
            "last_status": self.last_status,
        })
    }
}

/// Stream event and status payload builders
pub mod events {
    use serde_json::{json, Value};

    pub fn start(item_type: &str, name: &str, artist: &str) -> Value {
        json!({"event": "start", "item_type": item_type, "name": name, "artist": artist})
    }

    pub fn update(status: &str) -> Value {
        json!({"event": "update", "status": status})
    }

    pub fn queued(position: u32) -> Value {
        json!({"event": "update", "status": "queued", "queue_position": position})
    }

    pub fn progress(percent: f32) -> Value {
        json!({"event": "progress", "status": "downloading", "progress": percent})
    }

    pub fn track_complete(track: &str, completed: u32, total: u32) -> Value {
        json!({
            "event": "track_complete",
            "status": "downloading",
            "track": track,
            "completed_tracks": completed,
            "total_tracks": total,
        })
    }

    pub fn done() -> Value {
        json!({"event": "done", "status": "done"})
    }

    pub fn error(message: &str) -> Value {
        json!({"event": "error", "status": "error", "message": message})
    }

    pub fn end(status: &str) -> Value {
        json!({"event": "end", "status": status})
    }

    /// A bare status payload, as cached or returned in a status record
    pub fn payload(status: &str) -> Value {
        json!({"status": status})
    }

    pub fn payload_with_message(status: &str, message: &str) -> Value {
        json!({"status": status, "message": message})
    }
}
