use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Event delivered to subscribers and kept in a session's replay buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A record produced by the agent, forwarded untouched.
    ClaudeJson {
        #[serde(rename = "messageId")]
        message_id: String,
        data: Value,
    },
    UserMessage {
        #[serde(rename = "messageId")]
        message_id: String,
        data: UserMessageData,
    },
    Error {
        #[serde(rename = "messageId")]
        message_id: String,
        error: String,
    },
    Aborted {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Done {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct UserMessageData {
    pub message: String,
    pub timestamp: String,
}

impl StreamEvent {
    pub fn claude_json(message_id: impl Into<String>, data: Value) -> Self {
        Self::ClaudeJson {
            message_id: message_id.into(),
            data,
        }
    }

    pub fn user_message(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UserMessage {
            message_id: message_id.into(),
            data: UserMessageData {
                message: message.into(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        }
    }

    pub fn error(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            message_id: message_id.into(),
            error: error.into(),
        }
    }

    pub fn aborted(message_id: impl Into<String>) -> Self {
        Self::Aborted {
            message_id: message_id.into(),
        }
    }

    pub fn done(message_id: impl Into<String>) -> Self {
        Self::Done {
            message_id: message_id.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::ClaudeJson { message_id, .. }
            | Self::UserMessage { message_id, .. }
            | Self::Error { message_id, .. }
            | Self::Aborted { message_id }
            | Self::Done { message_id } => message_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ClaudeJson { .. } => "claude_json",
            Self::UserMessage { .. } => "user_message",
            Self::Error { .. } => "error",
            Self::Aborted { .. } => "aborted",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes() {
        let events = vec![
            StreamEvent::claude_json("m1", json!({"type": "assistant", "session_id": "s1"})),
            StreamEvent::error("m1", "Claude CLI exited with code 1"),
            StreamEvent::aborted("m1"),
            StreamEvent::done("m1"),
        ];

        insta::assert_yaml_snapshot!(events, @r###"
        ---
        - type: claude_json
          messageId: m1
          data:
            session_id: s1
            type: assistant
        - type: error
          messageId: m1
          error: Claude CLI exited with code 1
        - type: aborted
          messageId: m1
        - type: done
          messageId: m1
        "###);
    }

    #[test]
    fn user_message_carries_text_and_timestamp() {
        let event = StreamEvent::user_message("m2", "hello");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "user_message");
        assert_eq!(value["messageId"], "m2");
        assert_eq!(value["data"]["message"], "hello");
        let timestamp = value["data"]["timestamp"].as_str().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn round_trips_from_wire() {
        let event: StreamEvent =
            serde_json::from_value(json!({"type": "done", "messageId": "abc"})).expect("decode");
        assert_eq!(event, StreamEvent::done("abc"));
        assert_eq!(event.message_id(), "abc");
        assert_eq!(event.event_type(), "done");
    }
}
