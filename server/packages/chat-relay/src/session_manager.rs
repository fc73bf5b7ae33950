use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chat_relay_agent_stream::{EventProducer, ExecuteRequest};
use futures::StreamExt;
use tokio::runtime::Handle;

use crate::history::HistoryReconciler;
use crate::session::{Session, SessionHandle, SessionInfo};
use crate::stream_event::StreamEvent;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionHandle, Arc<Session>>,
    by_external_id: HashMap<String, SessionHandle>,
}

/// Owns every live session and drives their queues.
///
/// Lock order is registry, then session. A session's own methods never take
/// the registry lock.
pub struct SessionManager {
    producer: Arc<dyn EventProducer>,
    history: HistoryReconciler,
    idle_timeout: Duration,
    next_handle: AtomicU64,
    registry: Mutex<Registry>,
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        producer: Arc<dyn EventProducer>,
        history: HistoryReconciler,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            producer,
            history,
            idle_timeout,
            next_handle: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn history(&self) -> &HistoryReconciler {
        &self.history
    }

    /// Returns the live session for `external_id`, or creates one. A new
    /// session bound to a known id is seeded from the persisted transcript;
    /// load failures leave it with an empty history. Without an id a fresh
    /// pending session is returned.
    pub async fn get_or_create_session(
        &self,
        external_id: Option<&str>,
        working_directory: Option<PathBuf>,
    ) -> Arc<Session> {
        let Some(external_id) = external_id.filter(|id| !id.is_empty()) else {
            return self.insert_session(None, working_directory, None);
        };
        if let Some(session) = self.get_session(external_id) {
            return session;
        }

        let project = project_for(working_directory.as_deref());
        let history = match self.history.load(&project, external_id).await {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(
                    session_id = external_id,
                    project = %project,
                    error = %err,
                    "history reconciliation failed, starting empty"
                );
                None
            }
        };

        // Another caller may have registered the id while the transcript loaded.
        if let Some(session) = self.get_session(external_id) {
            return session;
        }
        self.insert_session(Some(external_id), working_directory, history)
    }

    fn insert_session(
        &self,
        external_id: Option<&str>,
        working_directory: Option<PathBuf>,
        history: Option<Vec<StreamEvent>>,
    ) -> Arc<Session> {
        let session = {
            let mut registry = self.lock_registry();
            if let Some(existing) = external_id
                .and_then(|id| registry.by_external_id.get(id))
                .and_then(|handle| registry.sessions.get(handle))
            {
                return existing.clone();
            }
            let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(Session::new(
                handle,
                external_id.map(str::to_string),
                working_directory,
                history,
                self.self_ref.clone(),
            ));
            registry.sessions.insert(handle, session.clone());
            if let Some(id) = external_id {
                registry.by_external_id.insert(id.to_string(), handle);
            }
            session
        };
        tracing::info!(
            session = %session.handle(),
            session_id = external_id.unwrap_or(""),
            history_loaded = session.history_loaded(),
            "session created"
        );
        self.schedule_cleanup(&session);
        session
    }

    pub fn get_session(&self, external_id: &str) -> Option<Arc<Session>> {
        let registry = self.lock_registry();
        registry
            .by_external_id
            .get(external_id)
            .and_then(|handle| registry.sessions.get(handle))
            .cloned()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.lock_registry().sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.handle());
        sessions.iter().map(|session| session.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock_registry().sessions.len()
    }

    /// Indexes `session` under `external_id`, dropping any previous id it was
    /// indexed under. Both happen under one lock.
    pub fn register_session(&self, session: &Arc<Session>, external_id: &str) {
        let handle = session.handle();
        let mut registry = self.lock_registry();
        let previous = session.set_external_id(external_id);
        if let Some(previous) = previous.as_deref().filter(|previous| *previous != external_id) {
            if registry.by_external_id.get(previous) == Some(&handle) {
                registry.by_external_id.remove(previous);
            }
            tracing::info!(session = %handle, from = previous, to = external_id, "session re-keyed");
        }
        if let Some(other) = registry
            .by_external_id
            .insert(external_id.to_string(), handle)
            .filter(|other| *other != handle)
        {
            tracing::warn!(
                session = %handle,
                replaced = %other,
                session_id = external_id,
                "session id was indexed to another session"
            );
        }
        registry
            .sessions
            .entry(handle)
            .or_insert_with(|| session.clone());
    }

    pub fn broadcast(&self, session: &Session, event: StreamEvent) {
        session.broadcast(event);
    }

    pub(crate) fn spawn_process_queue(&self, session: Arc<Session>) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.process_queue(session).await;
                });
            }
            Err(_) => {
                tracing::error!(session = %session.handle(), "no async runtime to process queue");
            }
        }
    }

    /// Runs the next queued message of `session` to completion. No-op while
    /// another message is running or when the queue is empty.
    pub async fn process_queue(&self, session: Arc<Session>) {
        let Some(dispatch) = session.begin_next() else {
            return;
        };
        let message_id = dispatch.message.message_id.clone();
        let started = Instant::now();

        let options = dispatch.message.options;
        let mut request = ExecuteRequest::new(dispatch.message.content, dispatch.cancel.clone());
        request.resume_id = dispatch.resume_id;
        request.allowed_tools = options.allowed_tools;
        request.permission_mode = options.permission_mode;
        request.working_directory = options
            .working_directory
            .or_else(|| session.working_directory().map(Path::to_path_buf));

        tracing::info!(
            session = %session.handle(),
            message_id = %message_id,
            resume_id = request.resume_id.as_deref().unwrap_or(""),
            "executing message"
        );

        let cancel = dispatch.cancel;
        let mut stream = self.producer.execute(request);
        let mut failure = None;
        let mut produced: u64 = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Some(external_id) = message.session_id() {
                        if session.external_id().as_deref() != Some(external_id) {
                            self.register_session(&session, external_id);
                        }
                    }
                    let event = StreamEvent::claude_json(message_id.clone(), message.into_value());
                    if !session.broadcast_unless_cancelled(event, &cancel) {
                        break;
                    }
                    produced += 1;
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    if !cancel.is_cancelled() {
                        tracing::warn!(
                            session = %session.handle(),
                            message_id = %message_id,
                            error = %err,
                            "execution failed"
                        );
                        failure = Some(err.to_string());
                    }
                    break;
                }
            }
        }
        drop(stream);

        let cancelled = cancel.is_cancelled();
        let completion = session.finish_execution(&message_id, failure);
        tracing::info!(
            session = %session.handle(),
            message_id = %message_id,
            events = produced,
            cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );

        if completion.has_pending {
            self.spawn_process_queue(session);
        } else if completion.quiescent {
            self.schedule_cleanup(&session);
        }
    }

    /// Arms (or re-arms) the idle timer of `session`. The delay counts from
    /// the session's last activity.
    pub(crate) fn schedule_cleanup(&self, session: &Arc<Session>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let delay = self.idle_timeout.saturating_sub(session.idle_for());
        let manager = self.self_ref.clone();
        let weak_session = Arc::downgrade(session);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let (Some(manager), Some(session)) = (manager.upgrade(), weak_session.upgrade()) {
                manager.run_idle_cleanup(&session);
            }
        });
        session.replace_cleanup_timer(timer);
    }

    fn run_idle_cleanup(&self, session: &Arc<Session>) {
        // A newer timer may have been armed while this one was firing; that
        // one owns the cleanup now.
        let owns_timer = tokio::task::try_id()
            .is_some_and(|task| session.release_cleanup_timer(task));
        if !owns_timer {
            return;
        }
        if !session.is_quiescent() {
            return;
        }
        let handle = session.handle();
        {
            let mut registry = self.lock_registry();
            if session.is_evictable(self.idle_timeout) {
                registry.sessions.remove(&handle);
                if let Some(external_id) = session.external_id() {
                    if registry.by_external_id.get(&external_id) == Some(&handle) {
                        registry.by_external_id.remove(&external_id);
                    }
                }
                tracing::info!(
                    session = %handle,
                    session_id = session.external_id().as_deref().unwrap_or(""),
                    "evicted idle session"
                );
                return;
            }
        }
        tracing::debug!(session = %handle, "session active since cleanup was armed, rescheduling");
        self.schedule_cleanup(session);
    }

    /// Cancels every running execution and closes all subscribers.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut registry = self.lock_registry();
            registry.by_external_id.clear();
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        tracing::info!(sessions = sessions.len(), "shutting down sessions");
        for session in sessions {
            session.close();
        }
    }
}

fn project_for(working_directory: Option<&Path>) -> String {
    match working_directory {
        Some(dir) => dir.display().to_string(),
        None => std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
    }
}
