//! Structured-event producers.
//!
//! A producer turns one prompt into a lazy, ordered stream of agent records
//! (`system`, `assistant`, `user`, `result`). The stream ends when the agent
//! finishes, yields [`ProducerError::Cancelled`] once the request's token is
//! triggered, or yields any other [`ProducerError`] on failure.

use std::io;
use std::path::PathBuf;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod claude;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use claude::ClaudeCliProducer;

pub type EventStream = BoxStream<'static, Result<AgentMessage, ProducerError>>;

pub trait EventProducer: Send + Sync + 'static {
    fn execute(&self, request: ExecuteRequest) -> EventStream;
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub resume_id: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub permission_mode: Option<String>,
    pub cancel: CancellationToken,
}

impl ExecuteRequest {
    pub fn new(prompt: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            prompt: prompt.into(),
            resume_id: None,
            allowed_tools: None,
            working_directory: None,
            permission_mode: None,
            cancel,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("execution cancelled")]
    Cancelled,
    #[error("failed to spawn agent `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: io::Error,
    },
    #[error("failed to capture agent stdout")]
    MissingStdout,
    #[error("failed to read agent output: {0}")]
    Read(#[source] io::Error),
    #[error("{message}")]
    Exited {
        code: Option<i32>,
        message: String,
    },
    #[error("{0}")]
    Other(String),
}

impl ProducerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMessageKind {
    System,
    Assistant,
    User,
    Result,
    Other,
}

/// One record emitted by the agent, kept as raw JSON so that unknown fields
/// reach subscribers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentMessage(Value);

impl AgentMessage {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn kind(&self) -> AgentMessageKind {
        match self.0.get("type").and_then(Value::as_str) {
            Some("system") => AgentMessageKind::System,
            Some("assistant") => AgentMessageKind::Assistant,
            Some("user") => AgentMessageKind::User,
            Some("result") => AgentMessageKind::Result,
            _ => AgentMessageKind::Other,
        }
    }

    /// The agent's own conversation id, when the record carries one.
    pub fn session_id(&self) -> Option<&str> {
        self.0
            .get("session_id")
            .and_then(Value::as_str)
            .or_else(|| self.0.get("sessionId").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for AgentMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_accepts_both_spellings() {
        let snake = AgentMessage::new(json!({"type": "system", "session_id": "abc"}));
        let camel = AgentMessage::new(json!({"type": "result", "sessionId": "def"}));
        let missing = AgentMessage::new(json!({"type": "assistant"}));
        let empty = AgentMessage::new(json!({"type": "assistant", "session_id": ""}));

        assert_eq!(snake.session_id(), Some("abc"));
        assert_eq!(camel.session_id(), Some("def"));
        assert_eq!(missing.session_id(), None);
        assert_eq!(empty.session_id(), None);
    }

    #[test]
    fn kind_reads_type_tag() {
        assert_eq!(
            AgentMessage::new(json!({"type": "assistant"})).kind(),
            AgentMessageKind::Assistant
        );
        assert_eq!(
            AgentMessage::new(json!({"type": "stream_event"})).kind(),
            AgentMessageKind::Other
        );
        assert_eq!(AgentMessage::new(json!("text")).kind(), AgentMessageKind::Other);
    }

    #[test]
    fn serializes_transparently() {
        let message = AgentMessage::new(json!({"type": "user", "message": {"content": []}}));
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value, json!({"type": "user", "message": {"content": []}}));
    }
}
