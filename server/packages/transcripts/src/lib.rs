//! Persisted conversation transcripts.
//!
//! The agent writes one newline-delimited JSON file per conversation under
//! `<root>/<encoded project path>/<session id>.jsonl`. This crate resolves a
//! project to its directory, summarizes the transcripts in it, and decodes a
//! single transcript into raw records.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

mod grouping;
mod store;

pub use grouping::group_conversations;
pub use store::{encode_project_path, ClaudeProjectsStore, PREVIEW_MAX_CHARS};

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a listing needs to know about one transcript file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSummary {
    pub session_id: String,
    pub message_ids: HashSet<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub last_preview: Option<String>,
}

pub trait TranscriptStore: Send + Sync + 'static {
    /// Maps a project path (or an already-encoded directory name) to the
    /// store's project id. `None` when no such project has transcripts.
    fn resolve_project_directory(&self, path_or_name: &str) -> Option<String>;

    fn list_transcript_files(
        &self,
        project_id: &str,
    ) -> Result<Vec<TranscriptSummary>, TranscriptError>;

    /// `Ok(None)` when the transcript does not exist.
    fn read_transcript(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Option<Vec<Value>>, TranscriptError>;
}
