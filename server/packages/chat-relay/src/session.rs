use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chat_relay_error::RelayError;
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::{self, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::session_manager::SessionManager;
use crate::stream_event::{new_message_id, StreamEvent};
use crate::subscriber::{Subscriber, SubscriberClosed};

/// Stable registry key. Unlike the agent's session id it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub(crate) u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: String,
    pub content: String,
    pub enqueued_at: DateTime<Utc>,
    pub options: MessageOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortOutcome {
    pub aborted: bool,
    pub cleared_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub subscribers: usize,
    pub queued_messages: usize,
    pub processing: bool,
    pub history_length: usize,
    pub history_loaded: bool,
    pub created_at: String,
    pub idle_seconds: u64,
}

/// Work handed to the processing loop for one dequeued message.
pub(crate) struct Dispatch {
    pub message: QueuedMessage,
    pub cancel: CancellationToken,
    pub resume_id: Option<String>,
}

pub(crate) struct Completion {
    pub has_pending: bool,
    pub quiescent: bool,
}

struct Execution {
    message_id: String,
    cancel: CancellationToken,
}

struct SessionState {
    external_id: Option<String>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    queue: VecDeque<QueuedMessage>,
    history: Vec<StreamEvent>,
    // `Some` exactly while a message is being processed.
    current_execution: Option<Execution>,
    history_loaded: bool,
    last_activity: Instant,
    cleanup_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn cancel_cleanup(&mut self) {
        if let Some(timer) = self.cleanup_timer.take() {
            timer.abort();
        }
    }

    fn is_quiescent(&self) -> bool {
        self.subscribers.is_empty() && self.queue.is_empty() && self.current_execution.is_none()
    }

    fn broadcast(&mut self, event: StreamEvent) {
        self.touch();
        self.subscribers.retain(|subscriber| match subscriber.send(&event) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "evicting subscriber after failed delivery");
                false
            }
        });
        self.history.push(event);
    }
}

/// One logical conversation.
pub struct Session {
    handle: SessionHandle,
    working_directory: Option<PathBuf>,
    created_at: DateTime<Utc>,
    manager: Weak<SessionManager>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        handle: SessionHandle,
        external_id: Option<String>,
        working_directory: Option<PathBuf>,
        history: Option<Vec<StreamEvent>>,
        manager: Weak<SessionManager>,
    ) -> Self {
        let history_loaded = history.is_some();
        Self {
            handle,
            working_directory,
            created_at: Utc::now(),
            manager,
            state: Mutex::new(SessionState {
                external_id,
                subscribers: Vec::new(),
                queue: VecDeque::new(),
                history: history.unwrap_or_default(),
                current_execution: None,
                history_loaded,
                last_activity: Instant::now(),
                cleanup_timer: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn external_id(&self) -> Option<String> {
        self.lock().external_id.clone()
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().current_execution.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn history(&self) -> Vec<StreamEvent> {
        self.lock().history.clone()
    }

    pub fn history_loaded(&self) -> bool {
        self.lock().history_loaded
    }

    pub fn last_message_id(&self) -> Option<String> {
        self.lock()
            .history
            .last()
            .map(|event| event.message_id().to_string())
    }

    pub fn is_quiescent(&self) -> bool {
        self.lock().is_quiescent()
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Replays history to `subscriber` and then adds it to the live set.
    ///
    /// With `resume_from`, only events after the last event carrying that
    /// message id are replayed. An id that never appears replays nothing.
    /// If any replayed send fails the subscriber is not added.
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
        resume_from: Option<&str>,
    ) -> Result<(), SubscriberClosed> {
        let mut state = self.lock();
        let start = match resume_from {
            None => 0,
            Some(message_id) => state
                .history
                .iter()
                .rposition(|event| event.message_id() == message_id)
                .map(|index| index + 1)
                .unwrap_or(state.history.len()),
        };
        for event in &state.history[start..] {
            subscriber.send(event)?;
        }
        tracing::debug!(
            session = %self.handle,
            subscriber_id = subscriber.id(),
            replayed = state.history.len() - start,
            "subscriber attached"
        );
        state.subscribers.push(subscriber);
        state.touch();
        state.cancel_cleanup();
        Ok(())
    }

    /// Removes (and closes) a subscriber. Schedules idle cleanup when the
    /// session has nothing left to do.
    pub fn unsubscribe(self: &Arc<Self>, subscriber_id: &str) -> bool {
        let (removed, quiescent) = {
            let mut state = self.lock();
            let position = state
                .subscribers
                .iter()
                .position(|subscriber| subscriber.id() == subscriber_id);
            let removed = position.map(|index| state.subscribers.remove(index));
            (removed, state.is_quiescent())
        };
        let Some(removed) = removed else {
            return false;
        };
        removed.close();
        tracing::debug!(session = %self.handle, subscriber_id, "subscriber detached");
        if quiescent {
            if let Some(manager) = self.manager.upgrade() {
                manager.schedule_cleanup(self);
            }
        }
        true
    }

    /// Enqueues a prompt and returns its message id without waiting for it
    /// to run.
    pub fn queue_message(
        self: &Arc<Self>,
        content: impl Into<String>,
        options: MessageOptions,
    ) -> Result<String, RelayError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(RelayError::invalid_request("message must not be empty"));
        }
        let message_id = new_message_id();
        let idle = {
            let mut state = self.lock();
            state.touch();
            state.cancel_cleanup();
            state.queue.push_back(QueuedMessage {
                message_id: message_id.clone(),
                content,
                enqueued_at: Utc::now(),
                options,
            });
            tracing::info!(
                session = %self.handle,
                session_id = state.external_id.as_deref().unwrap_or(""),
                message_id = %message_id,
                queued = state.queue.len(),
                "message queued"
            );
            state.current_execution.is_none()
        };
        if idle {
            if let Some(manager) = self.manager.upgrade() {
                manager.spawn_process_queue(self.clone());
            }
        }
        Ok(message_id)
    }

    /// Interrupts the running execution (if any) and drops queued messages.
    pub fn abort(&self) -> AbortOutcome {
        let mut state = self.lock();
        let (aborted, message_id) = match &state.current_execution {
            Some(execution) => {
                let fresh = !execution.cancel.is_cancelled();
                execution.cancel.cancel();
                (fresh, execution.message_id.clone())
            }
            None => (false, new_message_id()),
        };
        let cleared: Vec<_> = state.queue.drain(..).collect();
        let cleared_queue_size = cleared.len();
        // Same critical section as the cancel, so `aborted` always precedes
        // the execution's `done`.
        state.broadcast(StreamEvent::aborted(message_id));
        // Dropped messages never run; close them out so their waiters finish.
        for message in cleared {
            state.broadcast(StreamEvent::aborted(message.message_id.clone()));
            state.broadcast(StreamEvent::done(message.message_id));
        }
        tracing::info!(
            session = %self.handle,
            aborted,
            cleared_queue_size,
            "session aborted"
        );
        AbortOutcome {
            aborted,
            cleared_queue_size,
        }
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.lock();
        SessionInfo {
            session_id: state.external_id.clone(),
            working_directory: self
                .working_directory
                .as_ref()
                .map(|dir| dir.display().to_string()),
            subscribers: state.subscribers.len(),
            queued_messages: state.queue.len(),
            processing: state.current_execution.is_some(),
            history_length: state.history.len(),
            history_loaded: state.history_loaded,
            created_at: self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            idle_seconds: state.last_activity.elapsed().as_secs(),
        }
    }

    pub(crate) fn broadcast(&self, event: StreamEvent) {
        self.lock().broadcast(event);
    }

    /// Broadcasts unless `cancel` has fired; checked under the same lock
    /// `abort` takes.
    pub(crate) fn broadcast_unless_cancelled(
        &self,
        event: StreamEvent,
        cancel: &CancellationToken,
    ) -> bool {
        let mut state = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        state.broadcast(event);
        true
    }

    pub(crate) fn set_external_id(&self, external_id: &str) -> Option<String> {
        self.lock().external_id.replace(external_id.to_string())
    }

    pub(crate) fn begin_next(&self) -> Option<Dispatch> {
        let mut state = self.lock();
        if state.current_execution.is_some() {
            return None;
        }
        let message = state.queue.pop_front()?;
        let cancel = CancellationToken::new();
        state.current_execution = Some(Execution {
            message_id: message.message_id.clone(),
            cancel: cancel.clone(),
        });
        state.cancel_cleanup();
        state.broadcast(StreamEvent::user_message(
            message.message_id.clone(),
            message.content.clone(),
        ));
        Some(Dispatch {
            resume_id: state.external_id.clone(),
            message,
            cancel,
        })
    }

    pub(crate) fn finish_execution(&self, message_id: &str, failure: Option<String>) -> Completion {
        let mut state = self.lock();
        if let Some(error) = failure {
            state.broadcast(StreamEvent::error(message_id, error));
        }
        state.current_execution = None;
        state.broadcast(StreamEvent::done(message_id));
        Completion {
            has_pending: !state.queue.is_empty(),
            quiescent: state.is_quiescent(),
        }
    }

    pub(crate) fn replace_cleanup_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = self.lock().cleanup_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Forgets the idle timer if it is the task `timer`. Returns false when
    /// a different timer has replaced it.
    pub(crate) fn release_cleanup_timer(&self, timer: task::Id) -> bool {
        let mut state = self.lock();
        match &state.cleanup_timer {
            Some(current) if current.id() == timer => {
                state.cleanup_timer = None;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_cleanup_timer(&self) -> bool {
        self.lock().cleanup_timer.is_some()
    }

    pub(crate) fn is_evictable(&self, idle_timeout: Duration) -> bool {
        let state = self.lock();
        state.is_quiescent() && state.last_activity.elapsed() >= idle_timeout
    }

    /// Cancels the running execution, drops the queue and closes every
    /// subscriber. Used on shutdown.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if let Some(execution) = &state.current_execution {
            execution.cancel.cancel();
        }
        state.queue.clear();
        state.cancel_cleanup();
        for subscriber in state.subscribers.drain(..) {
            subscriber.close();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("working_directory", &self.working_directory)
            .finish_non_exhaustive()
    }
}
