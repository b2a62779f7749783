//! The download queue manager
//!
//! One long-lived actor owns every tracked entry. Commands from
//! [`QueueHandle`], events from channel tasks, and timer fires all drain
//! through the manager's select loop, so state mutations are serialized and
//! status events apply strictly in arrival order. Renderers observe the
//! queue through the broadcast [`QueueEvent`] feed and on-demand
//! [`TaskSnapshot`]s; nothing here writes markup.
//!
//! The manager is also the only writer of the durable state cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use downbeat_server_client::{DownloadsClient, ItemType, SubmitRequest};

use crate::cache::{CacheSnapshot, CacheWriter, CachedTask, StateStore};
use crate::channel::{self, ChannelConfig, ChannelEvent, ChannelEventKind, ChannelHandle};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::task::{Applied, TaskEntry, TaskId, TaskState};

/// Capacity of the broadcast event feed
const EVENT_FEED_CAPACITY: usize = 256;

/// State change notifications for renderers
#[derive(Debug, Clone)]
pub enum QueueEvent {
    TaskAdded {
        id: TaskId,
    },
    TaskUpdated {
        id: TaskId,
        state: TaskState,
    },
    TaskRemoved {
        id: TaskId,
    },
    /// Display order changed; `ids` is the full new order
    OrderChanged {
        ids: Vec<TaskId>,
    },
    /// An auto-retry countdown started
    RetryScheduled {
        id: TaskId,
        delay: Duration,
        retry_number: u32,
    },
    /// A retry resubmission replaced the entry's handle
    RetryStarted {
        id: TaskId,
        retry_count: u32,
    },
    WindowChanged {
        size: usize,
    },
}

/// Point-in-time view of one entry, in display order
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub handle: String,
    pub item_type: ItemType,
    pub display_name: Option<String>,
    pub display_artist: Option<String>,
    pub state: TaskState,
    pub message: Option<String>,
    pub progress: Option<f32>,
    pub queue_position: Option<u32>,
    pub retry_count: u32,
    pub channel_open: bool,
    pub retry_pending: bool,
    pub cancel_in_flight: bool,
}

enum Command {
    Add {
        request: SubmitRequest,
        reply: oneshot::Sender<QueueResult<Vec<TaskId>>>,
    },
    Cancel {
        id: TaskId,
    },
    Retry {
        id: TaskId,
    },
    Dismiss {
        id: TaskId,
    },
    GrowWindow,
    SetPanelOpen {
        open: bool,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TaskSnapshot>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    RetryDue,
    CleanupDue,
}

struct TimerFire {
    id: TaskId,
    kind: TimerKind,
}

/// Caller-side handle to the manager actor
#[derive(Debug, Clone)]
pub struct QueueHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueHandle {
    /// Submit a download and register the resulting entries
    ///
    /// Returns one id per issued handle (artist jobs fan out).
    pub async fn add_task(&self, request: SubmitRequest) -> QueueResult<Vec<TaskId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Add { request, reply })
            .map_err(|_| QueueError::ManagerClosed)?;
        rx.await.map_err(|_| QueueError::ManagerClosed)?
    }

    /// Request cancellation of an entry's job
    pub fn cancel(&self, id: TaskId) {
        let _ = self.commands.send(Command::Cancel { id });
    }

    /// Retry a failed entry immediately, short-circuiting the countdown
    pub fn retry(&self, id: TaskId) {
        let _ = self.commands.send(Command::Retry { id });
    }

    /// Dismiss an entry: close its channel, purge its cache record, delete
    /// the remote record and drop it from the queue
    pub fn dismiss(&self, id: TaskId) {
        let _ = self.commands.send(Command::Dismiss { id });
    }

    /// Expand the visible window by the configured step
    pub fn grow_window(&self) {
        let _ = self.commands.send(Command::GrowWindow);
    }

    /// Persist the panel-open preference
    pub fn set_panel_open(&self, open: bool) {
        let _ = self.commands.send(Command::SetPanelOpen { open });
    }

    /// Fetch the current entries in display order
    pub async fn snapshot(&self) -> QueueResult<Vec<TaskSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| QueueError::ManagerClosed)?;
        rx.await.map_err(|_| QueueError::ManagerClosed)
    }

    /// Subscribe to state change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Stop the manager, flushing the state cache
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The queue manager actor
pub struct QueueManager {
    config: QueueConfig,
    channel_config: ChannelConfig,
    policy: RetryPolicy,
    client: DownloadsClient,

    entries: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,

    /// Open (or closing) channels; an id stays here until its `Closed`
    /// event arrives, so the admission cap is never overshot
    channels: HashMap<TaskId, ChannelHandle>,
    /// FIFO of entries waiting for an admission slot
    pending: VecDeque<TaskId>,

    retry_timers: HashMap<TaskId, CancellationToken>,
    cleanup_timers: HashMap<TaskId, CancellationToken>,

    visible_window: usize,
    cache_state: CacheSnapshot,
    cache: CacheWriter,

    commands_rx: mpsc::UnboundedReceiver<Command>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFire>,
    timer_rx: mpsc::UnboundedReceiver<TimerFire>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    /// Build the manager and its handle
    ///
    /// `initial` is the loaded (and bootstrap-pruned) cache snapshot; the
    /// persisted window size in it wins over the config default.
    pub fn new(
        config: QueueConfig,
        client: DownloadsClient,
        policy: RetryPolicy,
        store: Arc<dyn StateStore>,
        initial: CacheSnapshot,
    ) -> (Self, QueueHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        let (cache, _writer) = CacheWriter::spawn(store, config.cache_debounce);

        let channel_config = ChannelConfig {
            transport: config.transport,
            poll_interval: config.poll_interval,
            inactivity_timeout: config.inactivity_timeout,
            reconnect_delay: config.reconnect_delay,
        };
        let visible_window = initial.visible_window.unwrap_or(config.visible_window);

        let handle = QueueHandle {
            commands: commands_tx,
            events: events.clone(),
        };

        let manager = Self {
            config,
            channel_config,
            policy,
            client,
            entries: HashMap::new(),
            order: Vec::new(),
            channels: HashMap::new(),
            pending: VecDeque::new(),
            retry_timers: HashMap::new(),
            cleanup_timers: HashMap::new(),
            visible_window,
            cache_state: initial,
            cache,
            commands_rx,
            channel_tx,
            channel_rx,
            timer_tx,
            timer_rx,
            events,
        };
        (manager, handle)
    }

    /// Register entries reconstructed by the bootstrapper
    ///
    /// Restored error entries with retry budget left get their countdown
    /// armed here; exhausted ones settle and wait for dismissal.
    pub fn restore(&mut self, entries: Vec<TaskEntry>) {
        for mut entry in entries {
            let id = entry.id;
            if entry.state == TaskState::Error {
                match self.policy.decide(&entry) {
                    RetryDecision::Retry { delay } => {
                        let retry_number = entry.retry_count + 1;
                        self.entries.insert(id, entry);
                        self.schedule_retry(id, delay);
                        self.emit(QueueEvent::RetryScheduled {
                            id,
                            delay,
                            retry_number,
                        });
                    }
                    _ => {
                        entry.has_ended = true;
                        self.entries.insert(id, entry);
                    }
                }
            } else {
                self.entries.insert(id, entry);
            }
            self.sync_cache_entry(id);
            self.emit(QueueEvent::TaskAdded { id });
        }
        self.push_cache();
        self.reorder();
        self.reconcile();
    }

    /// Run the actor until shutdown
    pub async fn run(mut self) {
        info!(
            entries = self.entries.len(),
            window = self.visible_window,
            cap = self.config.connection_cap,
            "queue manager running"
        );
        loop {
            tokio::select! {
                Some(command) = self.commands_rx.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.channel_rx.recv() => self.handle_channel_event(event),
                Some(fire) = self.timer_rx.recv() => self.handle_timer(fire).await,
                else => break,
            }
        }
        self.shutdown();
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Add { request, reply } => {
                let result = self.add_task(request).await;
                let _ = reply.send(result);
            }
            Command::Cancel { id } => self.cancel(id).await,
            Command::Retry { id } => {
                self.cancel_retry_timer(id);
                self.attempt_retry(id).await;
            }
            Command::Dismiss { id } => self.cleanup(id).await,
            Command::GrowWindow => {
                self.visible_window += self.config.window_step;
                self.cache_state.visible_window = Some(self.visible_window);
                self.push_cache();
                self.emit(QueueEvent::WindowChanged {
                    size: self.visible_window,
                });
                self.reconcile();
            }
            Command::SetPanelOpen { open } => {
                self.cache_state.panel_open = Some(open);
                self.push_cache();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn add_task(&mut self, request: SubmitRequest) -> QueueResult<Vec<TaskId>> {
        let outcome = self.client.submit(&request).await?;
        let handles = outcome.into_handles();
        let mut ids = Vec::with_capacity(handles.len());

        for handle in handles {
            let entry = if request.item_type.fans_out() {
                // Each fanned-out release keeps its own server-echoed
                // descriptor, so a retry resubmits just that release
                match self.client.status(&handle).await {
                    Ok(record) => TaskEntry::from_remote(&handle, record, None, 0),
                    Err(e) => {
                        warn!(%handle, error = %e, "echo fetch failed, keeping artist descriptor");
                        TaskEntry::new(&handle, request.clone())
                    }
                }
            } else {
                TaskEntry::new(&handle, request.clone())
            };

            let id = entry.id;
            debug_assert!(!self.entries.contains_key(&id));
            self.entries.insert(id, entry);
            self.sync_cache_entry(id);
            self.emit(QueueEvent::TaskAdded { id });
            ids.push(id);
        }

        debug!(count = ids.len(), "entries registered");
        self.push_cache();
        self.reorder();
        self.reconcile();
        Ok(ids)
    }

    async fn cancel(&mut self, id: TaskId) {
        let handle = {
            let Some(entry) = self.entries.get_mut(&id) else {
                return;
            };
            if entry.state.is_terminal() || entry.has_ended || entry.cancel_in_flight {
                return;
            }
            entry.cancel_in_flight = true;
            entry.handle.clone()
        };
        // Optimistic "cancelling" indication; reverted below on failure
        self.emit_updated(id);

        match self.client.cancel(&handle).await {
            Ok(()) => {
                self.cancel_retry_timer(id);
                if let Some(channel) = self.channels.get(&id) {
                    channel.close();
                }
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.confirm_cancelled();
                }
                self.sync_cache_entry(id);
                self.push_cache();
                self.emit_updated(id);
                self.schedule_cleanup(id);
                self.reorder();
            }
            Err(e) => {
                // Cancellation is never assumed: state untouched, control
                // re-enabled
                warn!(%handle, error = %e, "cancel request failed");
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.cancel_in_flight = false;
                }
                self.emit_updated(id);
            }
        }
    }

    async fn attempt_retry(&mut self, id: TaskId) {
        let (request, old_handle) = {
            let Some(entry) = self.entries.get(&id) else {
                return;
            };
            match self.policy.decide(entry) {
                RetryDecision::Retry { .. } => {}
                decision => {
                    debug!(?decision, "retry refused");
                    return;
                }
            }
            (entry.request.clone(), entry.handle.clone())
        };

        match self.client.submit(&request).await {
            Ok(outcome) => {
                let mut handles = outcome.into_handles().into_iter();
                let Some(new_handle) = handles.next() else {
                    warn!("resubmission returned no handle");
                    self.arm_retry_countdown(id);
                    return;
                };
                if handles.next().is_some() {
                    warn!("resubmission fanned out unexpectedly, tracking first handle only");
                }

                // Error channels close themselves, but never leave two
                // channels addressing one slot
                if let Some(channel) = self.channels.get(&id) {
                    channel.close();
                }
                self.cache_state.tasks.remove(&old_handle);
                let retry_count = {
                    let Some(entry) = self.entries.get_mut(&id) else {
                        return;
                    };
                    entry.reset_for_retry(&new_handle);
                    entry.retry_count
                };
                info!(old = %old_handle, new = %new_handle, retry_count, "job resubmitted");
                // The superseded record would otherwise resurface at the
                // next startup reconciliation
                if let Err(e) = self.client.delete(&old_handle).await {
                    warn!(handle = %old_handle, error = %e, "stale record delete failed");
                }
                self.sync_cache_entry(id);
                self.push_cache();
                self.emit(QueueEvent::RetryStarted { id, retry_count });
                self.emit_updated(id);
                self.reorder();
                self.reconcile();
            }
            Err(e) => {
                // A failed resubmission spends no retry budget; arm another
                // countdown and try again
                warn!(error = %e, "resubmission failed");
                self.arm_retry_countdown(id);
            }
        }
    }

    /// Arm the auto-retry countdown if the policy allows one, otherwise
    /// settle the entry so only dismissal remains
    fn arm_retry_countdown(&mut self, id: TaskId) {
        let decision = match self.entries.get(&id) {
            Some(entry) => (self.policy.decide(entry), entry.retry_count),
            None => return,
        };
        match decision {
            (RetryDecision::Retry { delay }, retry_count) => {
                self.schedule_retry(id, delay);
                self.emit(QueueEvent::RetryScheduled {
                    id,
                    delay,
                    retry_number: retry_count + 1,
                });
            }
            _ => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.has_ended = true;
                }
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        let ChannelEvent { id, kind } = event;
        match kind {
            ChannelEventKind::Closed => {
                self.channels.remove(&id);
                self.reconcile();
            }
            ChannelEventKind::Event(event) => {
                let applied = match self.entries.get_mut(&id) {
                    Some(entry) => entry.apply(&event),
                    None => return,
                };
                match applied {
                    Applied::Ignored => {}
                    Applied::Touched | Applied::Advanced => {
                        self.sync_cache_entry(id);
                        self.push_cache();
                        self.emit_updated(id);
                        self.reorder();
                    }
                    Applied::Finished => {
                        self.sync_cache_entry(id);
                        self.push_cache();
                        self.emit_updated(id);
                        self.schedule_cleanup(id);
                        self.reorder();
                    }
                    Applied::Failed => {
                        self.sync_cache_entry(id);
                        self.push_cache();
                        self.emit_updated(id);
                        self.arm_retry_countdown(id);
                        self.reorder();
                    }
                }
            }
        }
    }

    async fn handle_timer(&mut self, fire: TimerFire) {
        match fire.kind {
            // A fire whose timer was already cancelled is stale
            TimerKind::RetryDue => {
                if self.retry_timers.remove(&fire.id).is_some() {
                    self.attempt_retry(fire.id).await;
                }
            }
            TimerKind::CleanupDue => {
                if self.cleanup_timers.remove(&fire.id).is_some() {
                    self.cleanup(fire.id).await;
                }
            }
        }
    }

    /// Remove an entry: close its channel, drop its timers, purge its cache
    /// record, and best-effort delete the remote record
    async fn cleanup(&mut self, id: TaskId) {
        self.cancel_retry_timer(id);
        self.cancel_cleanup_timer(id);
        if let Some(channel) = self.channels.get(&id) {
            channel.close();
        }
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.pending.retain(|p| *p != id);
        self.cache_state.tasks.remove(&entry.handle);
        self.push_cache();

        if let Err(e) = self.client.delete(&entry.handle).await {
            warn!(handle = %entry.handle, error = %e, "remote delete failed");
        }

        self.emit(QueueEvent::TaskRemoved { id });
        self.reorder();
        self.reconcile();
    }

    // ---- timers ----

    fn schedule_retry(&mut self, id: TaskId, delay: Duration) {
        self.cancel_retry_timer(id);
        let token = CancellationToken::new();
        self.retry_timers.insert(id, token.clone());
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(TimerFire { id, kind: TimerKind::RetryDue });
                }
            }
        });
    }

    fn schedule_cleanup(&mut self, id: TaskId) {
        self.cancel_cleanup_timer(id);
        let token = CancellationToken::new();
        self.cleanup_timers.insert(id, token.clone());
        let tx = self.timer_tx.clone();
        let grace = self.config.cleanup_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let _ = tx.send(TimerFire { id, kind: TimerKind::CleanupDue });
                }
            }
        });
    }

    fn cancel_retry_timer(&mut self, id: TaskId) {
        if let Some(token) = self.retry_timers.remove(&id) {
            token.cancel();
        }
    }

    fn cancel_cleanup_timer(&mut self, id: TaskId) {
        if let Some(token) = self.cleanup_timers.remove(&id) {
            token.cancel();
        }
    }

    // ---- ordering, window, admission ----

    fn reorder(&mut self) {
        let order = compute_order(self.entries.values());
        if order != self.order {
            self.order = order;
            self.emit(QueueEvent::OrderChanged {
                ids: self.order.clone(),
            });
        }
    }

    /// Align open channels with the visible window and the connection cap
    fn reconcile(&mut self) {
        let desired: HashSet<TaskId> = self
            .order
            .iter()
            .take(self.visible_window)
            .filter(|id| self.entries.get(id).is_some_and(wants_channel))
            .copied()
            .collect();

        // Entries rotated out of the window (or settled) go dormant
        for (id, channel) in &self.channels {
            if !desired.contains(id) {
                channel.close();
            }
        }

        self.pending
            .retain(|id| desired.contains(id) && !self.channels.contains_key(id));
        for id in self.order.iter().take(self.visible_window) {
            if desired.contains(id)
                && !self.channels.contains_key(id)
                && !self.pending.contains(id)
            {
                self.pending.push_back(*id);
            }
        }

        while self.channels.len() < self.config.connection_cap {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            debug!(handle = %entry.handle, "opening status channel");
            let channel = channel::spawn(
                self.client.clone(),
                self.channel_config,
                id,
                entry.handle.clone(),
                entry.item_type,
                entry.last_payload.clone(),
                self.channel_tx.clone(),
            );
            self.channels.insert(id, channel);
        }
    }

    // ---- cache ----

    fn sync_cache_entry(&mut self, id: TaskId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if let Some(payload) = &entry.last_payload {
            self.cache_state.tasks.insert(
                entry.handle.clone(),
                CachedTask {
                    payload: payload.clone(),
                    retry_count: entry.retry_count,
                },
            );
        }
    }

    fn push_cache(&self) {
        self.cache.push(self.cache_state.clone());
    }

    // ---- views ----

    fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| TaskSnapshot {
                id: entry.id,
                handle: entry.handle.clone(),
                item_type: entry.item_type,
                display_name: entry.display_name.clone(),
                display_artist: entry.display_artist.clone(),
                state: entry.state,
                message: entry.display_message().map(str::to_string),
                progress: entry.last_payload.as_ref().and_then(|p| p.progress),
                queue_position: entry.queue_position(),
                retry_count: entry.retry_count,
                channel_open: self.channels.contains_key(&entry.id),
                retry_pending: self.retry_timers.contains_key(&entry.id),
                cancel_in_flight: entry.cancel_in_flight,
            })
            .collect()
    }

    fn emit_updated(&self, id: TaskId) {
        if let Some(entry) = self.entries.get(&id) {
            self.emit(QueueEvent::TaskUpdated {
                id,
                state: entry.state,
            });
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn shutdown(self) {
        info!("queue manager shutting down");
        for channel in self.channels.values() {
            channel.close();
        }
        for token in self.retry_timers.values() {
            token.cancel();
        }
        for token in self.cleanup_timers.values() {
            token.cancel();
        }
        // Dropping the cache writer flushes the last pushed snapshot
        self.push_cache();
    }
}

fn wants_channel(entry: &TaskEntry) -> bool {
    !entry.has_ended && !entry.state.is_terminal()
}

/// Display order: entries needing attention (error/cancelled) first, then
/// live ones, then server-queued ones by queue position. The first two
/// groups surface the stalest entry first.
fn sort_group(entry: &TaskEntry) -> u8 {
    match entry.state {
        TaskState::Error | TaskState::Cancelled => 0,
        TaskState::Queued => 2,
        _ => 1,
    }
}

pub(crate) fn compute_order<'a>(entries: impl Iterator<Item = &'a TaskEntry>) -> Vec<TaskId> {
    let mut sorted: Vec<&TaskEntry> = entries.collect();
    sorted.sort_by(|a, b| {
        let (ga, gb) = (sort_group(a), sort_group(b));
        ga.cmp(&gb)
            .then_with(|| {
                if ga == 2 {
                    a.queue_position()
                        .unwrap_or(u32::MAX)
                        .cmp(&b.queue_position().unwrap_or(u32::MAX))
                } else {
                    a.last_updated_at.cmp(&b.last_updated_at)
                }
            })
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted.into_iter().map(|entry| entry.id).collect()
}
