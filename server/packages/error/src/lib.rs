use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SessionNotFound,
    ProjectNotFound,
    TranscriptNotFound,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-relay:error:invalid_request",
            Self::SessionNotFound => "urn:chat-relay:error:session_not_found",
            Self::ProjectNotFound => "urn:chat-relay:error:project_not_found",
            Self::TranscriptNotFound => "urn:chat-relay:error:transcript_not_found",
            Self::StreamError => "urn:chat-relay:error:stream_error",
            Self::Timeout => "urn:chat-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SessionNotFound => "Session Not Found",
            Self::ProjectNotFound => "Project Not Found",
            Self::TranscriptNotFound => "Transcript Not Found",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SessionNotFound => 404,
            Self::ProjectNotFound => 404,
            Self::TranscriptNotFound => 404,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("project not found: {project}")]
    ProjectNotFound { project: String },
    #[error("transcript not found: {session_id}")]
    TranscriptNotFound { project: String, session_id: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::ProjectNotFound { .. } => ErrorType::ProjectNotFound,
            Self::TranscriptNotFound { .. } => ErrorType::TranscriptNotFound,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::StreamError { .. } => {}
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::ProjectNotFound { project } => {
                extensions.insert("project".to_string(), Value::String(project.clone()));
            }
            Self::TranscriptNotFound {
                project,
                session_id,
            } => {
                extensions.insert("project".to_string(), Value::String(project.clone()));
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
