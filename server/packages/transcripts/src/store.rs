use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{TranscriptError, TranscriptStore, TranscriptSummary};

pub const PREVIEW_MAX_CHARS: usize = 100;

const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Filesystem store rooted at the agent's projects directory
/// (`~/.claude/projects` by default).
#[derive(Debug, Clone)]
pub struct ClaudeProjectsStore {
    root: PathBuf,
}

impl ClaudeProjectsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".claude").join("projects"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn transcript_path(&self, project_id: &str, session_id: &str) -> Result<PathBuf, TranscriptError> {
        if !is_plain_component(session_id) {
            return Err(TranscriptError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self
            .root
            .join(project_id)
            .join(format!("{session_id}.{TRANSCRIPT_EXTENSION}")))
    }
}

impl TranscriptStore for ClaudeProjectsStore {
    fn resolve_project_directory(&self, path_or_name: &str) -> Option<String> {
        if path_or_name.is_empty() {
            return None;
        }
        if is_plain_component(path_or_name) && self.root.join(path_or_name).is_dir() {
            return Some(path_or_name.to_string());
        }
        let encoded = encode_project_path(path_or_name);
        self.root.join(&encoded).is_dir().then_some(encoded)
    }

    fn list_transcript_files(
        &self,
        project_id: &str,
    ) -> Result<Vec<TranscriptSummary>, TranscriptError> {
        if !is_plain_component(project_id) {
            return Err(TranscriptError::ProjectNotFound(project_id.to_string()));
        }
        let dir = self.root.join(project_id);
        let entries = fs::read_dir(&dir).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => TranscriptError::ProjectNotFound(project_id.to_string()),
            _ => TranscriptError::Io {
                path: dir.clone(),
                source,
            },
        })?;

        let mut summaries = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match summarize_file(session_id, &path) {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping transcript");
                }
            }
        }
        Ok(summaries)
    }

    fn read_transcript(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Option<Vec<Value>>, TranscriptError> {
        if !is_plain_component(project_id) {
            return Ok(None);
        }
        let path = self.transcript_path(project_id, session_id)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(TranscriptError::Io { path, source }),
        };
        let records = decode_records(&path, BufReader::new(file))?;
        Ok(Some(records))
    }
}

/// Directory name the agent uses for a project path: every `/`, `\`, `:`,
/// `.` and `_` becomes `-`.
pub fn encode_project_path(path: &str) -> String {
    path.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '.' | '_' => '-',
            other => other,
        })
        .collect()
}

fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(|ch: char| matches!(ch, '/' | '\\' | '\0'))
}

fn decode_records(path: &Path, reader: impl BufRead) -> Result<Vec<Value>, TranscriptError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| TranscriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => records.push(value),
            Ok(_) => {
                tracing::debug!(path = %path.display(), line = index + 1, "skipping non-object record");
            }
            Err(err) => {
                tracing::debug!(
                    path = %path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping malformed record"
                );
            }
        }
    }
    Ok(records)
}

fn summarize_file(session_id: &str, path: &Path) -> Result<TranscriptSummary, TranscriptError> {
    let file = fs::File::open(path).map_err(|source| TranscriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let records = decode_records(path, BufReader::new(file))?;
    let mut summary = summarize_records(session_id, &records);
    if summary.start_time.is_none() {
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        summary.start_time = modified;
        summary.last_time = summary.last_time.or(modified);
    }
    Ok(summary)
}

pub(crate) fn summarize_records(session_id: &str, records: &[Value]) -> TranscriptSummary {
    let mut message_ids = HashSet::new();
    let mut start_time: Option<DateTime<Utc>> = None;
    let mut last_time: Option<DateTime<Utc>> = None;
    let mut message_count = 0;
    let mut last_preview = None;

    for record in records {
        if let Some(id) = record.get("uuid").and_then(Value::as_str) {
            message_ids.insert(id.to_string());
        }
        if let Some(time) = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|time| time.with_timezone(&Utc))
        {
            start_time = Some(start_time.map_or(time, |start| start.min(time)));
            last_time = Some(last_time.map_or(time, |last| last.max(time)));
        }
        let kind = record.get("type").and_then(Value::as_str);
        if matches!(kind, Some("user" | "assistant")) {
            message_count += 1;
            if let Some(text) = record_text(record) {
                last_preview = Some(truncate_chars(&text, PREVIEW_MAX_CHARS));
            }
        }
    }

    TranscriptSummary {
        session_id: session_id.to_string(),
        message_ids,
        start_time,
        last_time,
        message_count,
        last_preview,
    }
}

fn record_text(record: &Value) -> Option<String> {
    let content = record.get("message")?.get("content")?;
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
