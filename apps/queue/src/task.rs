//! Tracked download jobs and their lifecycle state machine
//!
//! A [`TaskEntry`] is one UI slot: the `id` stays stable for the lifetime of
//! a submission, while the server-side `handle` is replaced whenever a retry
//! resubmits the job. State only ever advances through [`TaskEntry::apply`],
//! [`TaskEntry::reset_for_retry`] and [`TaskEntry::confirm_cancelled`], so
//! the transition rules live in one place.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use downbeat_server_client::{
    ItemType, StatusKind, StatusPayload, StatusRecord, StreamEvent, SubmitRequest,
};

/// Client-local identifier for one UI slot
pub type TaskId = Uuid;

/// Lifecycle state of a tracked job
///
/// `Queued → Initializing → Active → {Done | Error | Cancelled | Interrupted}`,
/// with `Error → Queued` possible only through a retry resubmission on the
/// same [`TaskId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Initializing,
    Active,
    Done,
    Error,
    Cancelled,
    Interrupted,
}

impl TaskState {
    /// Whether this state ends the job absent a fresh submission
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Error | TaskState::Cancelled | TaskState::Interrupted
        )
    }

    fn from_status(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Queued => TaskState::Queued,
            StatusKind::Initializing => TaskState::Initializing,
            StatusKind::Downloading | StatusKind::Processing => TaskState::Active,
            StatusKind::Done => TaskState::Done,
            StatusKind::Error => TaskState::Error,
            StatusKind::Cancelled => TaskState::Cancelled,
            StatusKind::Interrupted => TaskState::Interrupted,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Initializing => "initializing",
            TaskState::Active => "active",
            TaskState::Done => "done",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
            TaskState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// What applying an event to an entry changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Nothing changed: duplicate payload, or a terminal event for an entry
    /// already in a terminal state
    Ignored,
    /// Payload or labels refreshed without a lifecycle transition
    Touched,
    /// Non-terminal lifecycle transition
    Advanced,
    /// Terminal success reached
    Finished,
    /// Terminal failure reported (retry policy decides what happens next)
    Failed,
}

/// One tracked download job
#[derive(Debug, Clone)]
pub struct TaskEntry {
    /// Stable UI-slot identifier, unique among tracked entries
    pub id: TaskId,

    /// Server-assigned job handle; replaced on retry
    pub handle: String,

    pub item_type: ItemType,
    pub display_name: Option<String>,
    pub display_artist: Option<String>,

    /// The submit parameters, retained so a retry resubmits identically
    pub request: SubmitRequest,

    pub state: TaskState,

    /// Last raw status report received for the current handle
    pub last_payload: Option<StatusPayload>,

    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,

    /// Retries already spent on this logical job
    pub retry_count: u32,

    /// Set once the entry is settled: terminal success/cancellation, or an
    /// error with no retry pending. Guarantees no channel is open and no
    /// retry timer is armed for this entry.
    pub has_ended: bool,

    /// A cancel request is in flight; cleared if the server refuses it
    pub cancel_in_flight: bool,
}

impl TaskEntry {
    /// Create an entry for a freshly submitted job
    pub fn new(handle: impl Into<String>, request: SubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            handle: handle.into(),
            item_type: request.item_type,
            display_name: request.name.clone(),
            display_artist: request.artist.clone(),
            request,
            state: TaskState::Queued,
            last_payload: None,
            created_at: now,
            last_updated_at: now,
            retry_count: 0,
            has_ended: false,
            cancel_in_flight: false,
        }
    }

    /// Reconstruct an entry from a remote status record at startup
    ///
    /// Labels come from the server-echoed original request; the payload (from
    /// the record, or the caller's cached copy when the record carries none)
    /// seeds both the state and the first rendered message.
    pub fn from_remote(
        handle: impl Into<String>,
        record: StatusRecord,
        cached_payload: Option<StatusPayload>,
        retry_count: u32,
    ) -> Self {
        let payload = record.last_status.or(cached_payload);
        let state = payload
            .as_ref()
            .map(|p| TaskState::from_status(p.status))
            .unwrap_or(TaskState::Queued);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            handle: handle.into(),
            item_type: record.item_type,
            display_name: record.original_request.name.clone(),
            display_artist: record.original_request.artist.clone(),
            request: record.original_request,
            state,
            last_payload: payload,
            created_at: now,
            last_updated_at: now,
            retry_count,
            has_ended: false,
            cancel_in_flight: false,
        }
    }

    /// Server-reported queue position, if the job is still waiting
    pub fn queue_position(&self) -> Option<u32> {
        self.last_payload.as_ref().and_then(|p| p.queue_position)
    }

    /// Message to render for this entry right now
    pub fn display_message(&self) -> Option<&str> {
        self.last_payload.as_ref().and_then(|p| p.message.as_deref())
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    fn store_payload(&mut self, payload: &StatusPayload) -> bool {
        if self.last_payload.as_ref() == Some(payload) {
            return false;
        }
        self.last_payload = Some(payload.clone());
        self.touch();
        true
    }

    /// Move into a terminal state. Errors stay unsettled: the manager sets
    /// `has_ended` once the retry policy has spoken.
    fn enter(&mut self, state: TaskState) -> Applied {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.touch();
        if state == TaskState::Error {
            Applied::Failed
        } else {
            self.has_ended = true;
            Applied::Finished
        }
    }

    /// Apply one status event, returning what changed
    ///
    /// Duplicate terminal events and events arriving after the entry settled
    /// are idempotent no-ops.
    pub fn apply(&mut self, event: &StreamEvent) -> Applied {
        if self.has_ended {
            return Applied::Ignored;
        }

        match event {
            StreamEvent::Start {
                item_type,
                name,
                artist,
            } => {
                // The server's labels are authoritative
                if let Some(item_type) = item_type {
                    self.item_type = *item_type;
                }
                if name.is_some() {
                    self.display_name = name.clone();
                }
                if artist.is_some() {
                    self.display_artist = artist.clone();
                }
                if self.state == TaskState::Queued {
                    self.state = TaskState::Initializing;
                    self.touch();
                    Applied::Advanced
                } else {
                    self.touch();
                    Applied::Touched
                }
            }

            StreamEvent::Update { payload } | StreamEvent::Progress { payload } => {
                if payload.status.is_terminal() {
                    return self.apply_terminal(payload);
                }
                if !self.store_payload(payload) {
                    return Applied::Ignored;
                }
                let next = TaskState::from_status(payload.status);
                if next != self.state {
                    self.state = next;
                    Applied::Advanced
                } else {
                    Applied::Touched
                }
            }

            StreamEvent::TrackComplete { payload } => {
                if self.item_type == ItemType::Track {
                    // A bare track job has exactly one sub-item
                    self.store_payload(payload);
                    self.enter(TaskState::Done)
                } else if self.store_payload(payload) {
                    Applied::Touched
                } else {
                    Applied::Ignored
                }
            }

            StreamEvent::Done { payload } => {
                if self.state.is_terminal() {
                    return Applied::Ignored;
                }
                self.store_payload(payload);
                self.enter(TaskState::Done)
            }

            StreamEvent::Error { payload } | StreamEvent::End { payload }
                if payload.status.is_terminal() =>
            {
                self.apply_terminal(payload)
            }

            StreamEvent::Error { payload } => {
                // An error event with a non-terminal status field is still a
                // failure report
                if self.state.is_terminal() {
                    return Applied::Ignored;
                }
                self.store_payload(payload);
                self.enter(TaskState::Error)
            }

            StreamEvent::End { payload } => {
                if self.store_payload(payload) {
                    Applied::Touched
                } else {
                    Applied::Ignored
                }
            }
        }
    }

    fn apply_terminal(&mut self, payload: &StatusPayload) -> Applied {
        if self.state.is_terminal() {
            return Applied::Ignored;
        }
        self.store_payload(payload);
        self.enter(TaskState::from_status(payload.status))
    }

    /// Restart the state machine on this slot with a fresh handle
    pub fn reset_for_retry(&mut self, new_handle: impl Into<String>) {
        self.handle = new_handle.into();
        self.state = TaskState::Queued;
        self.last_payload = None;
        self.retry_count += 1;
        self.has_ended = false;
        self.cancel_in_flight = false;
        self.touch();
    }

    /// Server confirmed cancellation
    pub fn confirm_cancelled(&mut self) {
        self.state = TaskState::Cancelled;
        self.has_ended = true;
        self.cancel_in_flight = false;
        self.touch();
    }
}
