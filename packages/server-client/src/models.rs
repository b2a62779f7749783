//! Wire types for the download server's job API

use serde::{Deserialize, Serialize};

/// Kind of media resource a job downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Track,
    Album,
    Playlist,
    Artist,
}

impl ItemType {
    /// Artist submissions fan out into one job per release
    pub fn fans_out(&self) -> bool {
        matches!(self, ItemType::Artist)
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemType::Track => "track",
            ItemType::Album => "album",
            ItemType::Playlist => "playlist",
            ItemType::Artist => "artist",
        };
        f.write_str(s)
    }
}

/// Item-type-specific submission options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Release-type filter for artist jobs, e.g. "album,single"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_types: Option<String>,
}

impl SubmitOptions {
    pub fn is_empty(&self) -> bool {
        self.album_types.is_none()
    }
}

/// Parameters for submitting a download job
///
/// Retained verbatim by the client for the lifetime of the tracked job so a
/// retry can resubmit identically. The server echoes it back in
/// [`StatusRecord::original_request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Resource URL or provider id of the item to download
    pub url: String,

    /// What kind of item this is
    pub item_type: ItemType,

    /// Human-readable item name, if the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Human-readable artist name, if the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    /// Item-type-specific options
    #[serde(default, skip_serializing_if = "SubmitOptions::is_empty")]
    pub options: SubmitOptions,
}

impl SubmitRequest {
    pub fn new(url: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            url: url.into(),
            item_type,
            name: None,
            artist: None,
            options: SubmitOptions::default(),
        }
    }

    pub fn with_labels(
        mut self,
        name: Option<impl Into<String>>,
        artist: Option<impl Into<String>>,
    ) -> Self {
        self.name = name.map(Into::into);
        self.artist = artist.map(Into::into);
        self
    }

    pub fn with_album_types(mut self, album_types: impl Into<String>) -> Self {
        self.options.album_types = Some(album_types.into());
        self
    }
}

/// Response to a job submission
///
/// Track, album and playlist submissions yield a single handle; artist
/// submissions fan out into one handle per release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitOutcome {
    Single { handle: String },
    Fanout { handles: Vec<String> },
}

impl SubmitOutcome {
    /// Flatten into the list of issued handles
    pub fn into_handles(self) -> Vec<String> {
        match self {
            SubmitOutcome::Single { handle } => vec![handle],
            SubmitOutcome::Fanout { handles } => handles,
        }
    }
}

/// Server-side lifecycle state carried in status payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Queued,
    Initializing,
    Downloading,
    Processing,
    Done,
    Error,
    Cancelled,
    Interrupted,
}

impl StatusKind {
    /// Whether the job makes no further progress from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusKind::Done | StatusKind::Error | StatusKind::Cancelled | StatusKind::Interrupted
        )
    }
}

/// One raw status report for a job
///
/// Equality over the whole payload drives duplicate suppression: a report
/// identical to the previous one for the same handle carries no information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: StatusKind,

    /// Human-readable progress or error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Aggregate progress percentage, 0.0 - 100.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,

    /// Position in the server's work queue, for jobs not yet started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,

    /// Sub-items finished so far, for multi-item jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_tracks: Option<u32>,

    /// Total sub-items, for multi-item jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tracks: Option<u32>,

    /// Name of the sub-item the report refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

impl StatusPayload {
    pub fn of(status: StatusKind) -> Self {
        Self {
            status,
            message: None,
            progress: None,
            queue_position: None,
            completed_tracks: None,
            total_tracks: None,
            track: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Status record returned by a by-handle fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub item_type: ItemType,

    /// The submit parameters as the server received them
    pub original_request: SubmitRequest,

    /// Last status report, or None if the job has produced none yet
    #[serde(default)]
    pub last_status: Option<StatusPayload>,
}

/// One event on a job's status stream
///
/// Events arrive as NDJSON lines tagged by `event`, with the status fields
/// flattened alongside the tag:
///
/// ```json
/// {"event":"update","status":"downloading","progress":41.5}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Job accepted; may carry authoritative labels that correct the
    /// caller-supplied ones
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_type: Option<ItemType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
    },

    /// Non-terminal status change
    Update {
        #[serde(flatten)]
        payload: StatusPayload,
    },

    /// Non-terminal progress report
    Progress {
        #[serde(flatten)]
        payload: StatusPayload,
    },

    /// A sub-item of a multi-item job finished. Terminal for a bare track
    /// job, informational for album/playlist/artist jobs.
    TrackComplete {
        #[serde(flatten)]
        payload: StatusPayload,
    },

    /// Terminal success. Always carries at least `{"status":"done"}`.
    #[serde(alias = "complete")]
    Done {
        #[serde(flatten)]
        payload: StatusPayload,
    },

    /// Terminal failure reported by the server
    Error {
        #[serde(flatten)]
        payload: StatusPayload,
    },

    /// Stream close with the final status. A stream the server closes
    /// without reaching a terminal status simply ends without this event.
    End {
        #[serde(flatten)]
        payload: StatusPayload,
    },
}

impl StreamEvent {
    /// The status payload carried by this event, if any
    pub fn payload(&self) -> Option<&StatusPayload> {
        match self {
            StreamEvent::Start { .. } => None,
            StreamEvent::Update { payload }
            | StreamEvent::Progress { payload }
            | StreamEvent::TrackComplete { payload }
            | StreamEvent::Done { payload }
            | StreamEvent::Error { payload }
            | StreamEvent::End { payload } => Some(payload),
        }
    }
}

/// Server-supplied retry configuration
///
/// Retry delays are policy owned by the server, not client constants; the
/// defaults below only cover the case where the settings fetch itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum retries for one logical job
    pub max_retries: u32,

    /// Base delay before the first retry, in seconds
    pub retry_delay_secs: u64,

    /// Additional delay per prior retry, in seconds
    pub retry_delay_increase_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
            retry_delay_increase_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_outcome_single_parses() {
        let outcome: SubmitOutcome =
            serde_json::from_value(json!({"handle": "trk_1"})).unwrap();
        assert_eq!(outcome.into_handles(), vec!["trk_1".to_string()]);
    }

    #[test]
    fn submit_outcome_fanout_parses() {
        let outcome: SubmitOutcome =
            serde_json::from_value(json!({"handles": ["alb_1", "alb_2", "alb_3"]}))
                .unwrap();
        assert_eq!(outcome.into_handles().len(), 3);
    }

    #[test]
    fn stream_event_update_flattens_payload() {
        let event: StreamEvent = serde_json::from_value(json!({
            "event": "update",
            "status": "downloading",
            "progress": 41.5
        }))
        .unwrap();
        let payload = event.payload().unwrap();
        assert_eq!(payload.status, StatusKind::Downloading);
        assert_eq!(payload.progress, Some(41.5));
    }

    #[test]
    fn stream_event_complete_aliases_done() {
        let event: StreamEvent = serde_json::from_value(json!({
            "event": "complete",
            "status": "done"
        }))
        .unwrap();
        assert!(matches!(event, StreamEvent::Done { .. }));
    }

    #[test]
    fn stream_event_end_carries_final_status() {
        let event: StreamEvent = serde_json::from_value(json!({
            "event": "end",
            "status": "error",
            "message": "network"
        }))
        .unwrap();
        match event {
            StreamEvent::End { payload } => {
                assert_eq!(payload.status, StatusKind::Error);
                assert_eq!(payload.message.as_deref(), Some("network"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stream_event_rejects_unknown_tag() {
        let result: Result<StreamEvent, _> =
            serde_json::from_value(json!({"event": "telemetry", "status": "done"}));
        assert!(result.is_err());
    }

    #[test]
    fn submit_request_round_trips() {
        let request = SubmitRequest::new("spotify:artist:123", ItemType::Artist)
            .with_labels(Some("Queen"), Some("Queen"))
            .with_album_types("album,single");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["album_types"], "album,single");
        let back: SubmitRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn submit_request_omits_empty_options() {
        let request = SubmitRequest::new("spotify:track:9", ItemType::Track);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("options").is_none());
    }

    #[test]
    fn duplicate_payloads_compare_equal() {
        let a = StatusPayload::of(StatusKind::Downloading).with_message("3 of 12");
        let b = StatusPayload::of(StatusKind::Downloading).with_message("3 of 12");
        assert_eq!(a, b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(StatusKind::Done.is_terminal());
        assert!(StatusKind::Error.is_terminal());
        assert!(StatusKind::Cancelled.is_terminal());
        assert!(StatusKind::Interrupted.is_terminal());
        assert!(!StatusKind::Downloading.is_terminal());
        assert!(!StatusKind::Queued.is_terminal());
    }
}
