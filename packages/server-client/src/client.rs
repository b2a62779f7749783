//! Download server job API client implementation

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::models::{RetrySettings, StatusRecord, StreamEvent, SubmitOutcome, SubmitRequest};
use crate::stream::{EventLines, EventStream};

/// Default request timeout for unary calls in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Maximum error body size kept in error values
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// Client for the download server's job API
///
/// Unary calls carry a per-request timeout; the status event stream does
/// not, since it stays open for the lifetime of a job.
#[derive(Debug, Clone)]
pub struct DownloadsClient {
    http: Client,
    base: Url,
    request_timeout: Duration,
}

impl DownloadsClient {
    /// Create a client for the given server base URL
    ///
    /// # Errors
    /// Returns `ClientError::InvalidBaseUrl` if the URL does not parse or
    /// is not http(s).
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ClientError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidBaseUrl(format!(
                "{base_url}: scheme must be http or https"
            )));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .user_agent("Downbeat/0.1")
            .build()?;

        Ok(Self {
            http,
            base,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    /// Override the unary request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = self.base.to_string();
        for segment in segments {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(segment);
        }
        url
    }

    /// Submit a new download job
    ///
    /// Track/album/playlist submissions return one handle; artist
    /// submissions fan out into one handle per release.
    #[instrument(skip_all, fields(item_type = %request.item_type))]
    pub async fn submit(&self, request: &SubmitRequest) -> ClientResult<SubmitOutcome> {
        let response = self
            .http
            .post(self.endpoint(&["api", "downloads"]))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let outcome: SubmitOutcome = read_json(ensure_success(response, None).await?).await?;
        debug!(handles = outcome.clone().into_handles().len(), "job submitted");
        Ok(outcome)
    }

    /// Fetch the status record for one handle
    #[instrument(skip(self))]
    pub async fn status(&self, handle: &str) -> ClientResult<StatusRecord> {
        let response = self
            .http
            .get(self.endpoint(&["api", "downloads", handle]))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        read_json(ensure_success(response, Some(handle)).await?).await
    }

    /// Open the status event stream for one handle
    ///
    /// The returned stream yields parsed events until the server closes the
    /// connection; a malformed line yields a `Parse` error item without
    /// ending the stream.
    #[instrument(skip(self))]
    pub async fn events(&self, handle: &str) -> ClientResult<EventStream> {
        let response = self
            .http
            .get(self.endpoint(&["api", "downloads", handle, "events"]))
            .send()
            .await
            .map_err(map_send_error)?;

        let response = ensure_success(response, Some(handle)).await?;
        debug!("status stream open");
        Ok(Box::pin(EventLines::new(response.bytes_stream())))
    }

    /// Request cancellation of a job
    ///
    /// Success means the server confirmed the cancellation. Any error leaves
    /// the job in its previous state as far as the caller may assume.
    #[instrument(skip(self))]
    pub async fn cancel(&self, handle: &str) -> ClientResult<()> {
        let response = self
            .http
            .post(self.endpoint(&["api", "downloads", handle, "cancel"]))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        ensure_success(response, Some(handle)).await?;
        debug!("cancellation confirmed");
        Ok(())
    }

    /// Delete a job record. Idempotent: a missing record is success.
    #[instrument(skip(self))]
    pub async fn delete(&self, handle: &str) -> ClientResult<()> {
        let response = self
            .http
            .delete(self.endpoint(&["api", "downloads", handle]))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("record already gone");
            return Ok(());
        }
        ensure_success(response, None).await?;
        Ok(())
    }

    /// List all outstanding job handles
    #[instrument(skip(self))]
    pub async fn list(&self) -> ClientResult<Vec<String>> {
        let response = self
            .http
            .get(self.endpoint(&["api", "downloads"]))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        read_json(ensure_success(response, None).await?).await
    }

    /// Fetch server-supplied retry settings
    #[instrument(skip(self))]
    pub async fn settings(&self) -> ClientResult<RetrySettings> {
        let response = self
            .http
            .get(self.endpoint(&["api", "settings"]))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        read_json(ensure_success(response, None).await?).await
    }
}

fn map_send_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Http(e)
    }
}

async fn ensure_success(response: Response, handle: Option<&str>) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(handle) = handle {
            return Err(ClientError::HandleNotFound(handle.to_string()));
        }
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY_BYTES {
        body.truncate(MAX_ERROR_BODY_BYTES);
        body.push_str("...");
    }
    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let text = response.text().await.map_err(ClientError::Http)?;
    serde_json::from_str(&text).map_err(ClientError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemType, StatusKind};
    use futures_util::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> DownloadsClient {
        DownloadsClient::new(&server.uri()).unwrap()
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(matches!(
            DownloadsClient::new("not a url"),
            Err(ClientError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            DownloadsClient::new("ftp://example.com"),
            Err(ClientError::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn submit_returns_single_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .and(body_partial_json(json!({"item_type": "track"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handle": "trk_1"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client
            .submit(&SubmitRequest::new("spotify:track:1", ItemType::Track))
            .await
            .unwrap();
        assert_eq!(outcome.into_handles(), vec!["trk_1".to_string()]);
    }

    #[tokio::test]
    async fn submit_returns_fanout_handles() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/downloads"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"handles": ["alb_1", "alb_2", "alb_3"]})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client
            .submit(
                &SubmitRequest::new("spotify:artist:1", ItemType::Artist)
                    .with_album_types("album,single"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.into_handles().len(), 3);
    }

    #[tokio::test]
    async fn status_maps_404_to_handle_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/downloads/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.status("ghost").await.unwrap_err();
        assert!(matches!(err, ClientError::HandleNotFound(h) if h == "ghost"));
    }

    #[tokio::test]
    async fn delete_treats_404_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/downloads/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.delete("gone").await.is_ok());
    }

    #[tokio::test]
    async fn cancel_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/downloads/trk_1/cancel"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already finished"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.cancel("trk_1").await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 409, .. }));
    }

    #[tokio::test]
    async fn events_streams_parsed_events_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"event\":\"start\",\"item_type\":\"track\",\"name\":\"Song\"}\n",
            "{\"event\":\"update\",\"status\":\"downloading\",\"progress\":50.0}\n",
            "{\"event\":\"done\",\"status\":\"done\"}\n",
        );
        Mock::given(method("GET"))
            .and(path("/api/downloads/trk_1/events"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut events = client.events("trk_1").await.unwrap();

        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Start { .. }
        ));
        let update = events.next().await.unwrap().unwrap();
        assert_eq!(update.payload().unwrap().status, StatusKind::Downloading);
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Done { .. }
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn list_returns_outstanding_handles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/downloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["a", "b"])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn settings_parses_retry_configuration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "max_retries": 3,
                "retry_delay_secs": 5,
                "retry_delay_increase_secs": 5
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let settings = client.settings().await.unwrap();
        assert_eq!(settings, RetrySettings::default());
    }
}
