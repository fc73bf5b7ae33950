#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tower::util::ServiceExt;

use chat_relay::history::HistoryReconciler;
use chat_relay::router::{build_router, AppState};
use chat_relay::session::Session;
use chat_relay::session_manager::{SessionManager, DEFAULT_IDLE_TIMEOUT};
use chat_relay::stream_event::StreamEvent;
use chat_relay::subscriber::ChannelSubscriber;
use chat_relay_agent_stream::mock::MockProducer;
use chat_relay_transcripts::ClaudeProjectsStore;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestRelay {
    pub producer: Arc<MockProducer>,
    pub manager: Arc<SessionManager>,
    pub projects: TempDir,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        let projects = tempfile::tempdir().expect("create projects dir");
        let producer = Arc::new(MockProducer::new());
        let history = HistoryReconciler::new(Arc::new(ClaudeProjectsStore::new(projects.path())));
        let manager = SessionManager::new(producer.clone(), history, idle_timeout);
        Self {
            producer,
            manager,
            projects,
        }
    }

    pub fn router(&self) -> Router {
        build_router(AppState::new(self.manager.clone()))
    }

    /// Writes `<projects>/<project_dir>/<session_id>.jsonl`.
    pub fn write_transcript(&self, project_dir: &str, session_id: &str, lines: &[Value]) {
        let dir = self.projects.path().join(project_dir);
        fs::create_dir_all(&dir).expect("create project dir");
        write_jsonl(&dir.join(format!("{session_id}.jsonl")), lines);
    }
}

pub fn write_jsonl(path: &Path, lines: &[Value]) {
    let mut contents = String::new();
    for line in lines {
        contents.push_str(&line.to_string());
        contents.push('\n');
    }
    fs::write(path, contents).expect("write transcript");
}

pub fn attach(session: &Session, resume_from: Option<&str>) -> (String, UnboundedReceiver<StreamEvent>) {
    let (subscriber, receiver) = ChannelSubscriber::new();
    let id = chat_relay::subscriber::Subscriber::id(&subscriber).to_string();
    session
        .subscribe(Arc::new(subscriber), resume_from)
        .expect("subscribe");
    (id, receiver)
}

pub async fn next_event(receiver: &mut UnboundedReceiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(EVENT_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscriber closed")
}

/// Collects events up to and including the `done` of `message_id`.
pub async fn collect_until_done(
    receiver: &mut UnboundedReceiver<StreamEvent>,
    message_id: &str,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(receiver).await;
        let finished = event.is_done() && event.message_id() == message_id;
        events.push(event);
        if finished {
            return events;
        }
    }
}

pub fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::event_type).collect()
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

/// Parses the `data:` lines of an SSE body into JSON values.
pub fn parse_sse_data(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("sse data is json"))
        .collect()
}
