use std::sync::Arc;

use chat_relay_error::RelayError;
use chat_relay_transcripts::{group_conversations, TranscriptError, TranscriptStore};
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::stream_event::{new_message_id, StreamEvent};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_time: Option<String>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
}

/// Turns persisted transcripts into replayable stream events.
#[derive(Clone)]
pub struct HistoryReconciler {
    store: Arc<dyn TranscriptStore>,
}

impl HistoryReconciler {
    pub fn new(store: Arc<dyn TranscriptStore>) -> Self {
        Self { store }
    }

    /// Loads the transcript of `external_id` in `project` (a path or an
    /// encoded project directory name). Each record becomes a `claude_json`
    /// event with a fresh message id.
    pub async fn load(
        &self,
        project: &str,
        external_id: &str,
    ) -> Result<Vec<StreamEvent>, RelayError> {
        let records = self.read_records(project, external_id).await?;
        tracing::debug!(
            project,
            session_id = external_id,
            records = records.len(),
            "loaded transcript"
        );
        Ok(records
            .into_iter()
            .map(|record| StreamEvent::claude_json(new_message_id(), record))
            .collect())
    }

    /// Lists the project's conversations, one per logical conversation,
    /// newest first.
    pub async fn list_conversations(
        &self,
        project: &str,
    ) -> Result<Vec<ConversationSummary>, RelayError> {
        let store = self.store.clone();
        let project = project.to_string();
        let summaries = run_blocking(move || {
            let project_id = store
                .resolve_project_directory(&project)
                .ok_or_else(|| RelayError::ProjectNotFound {
                    project: project.clone(),
                })?;
            store
                .list_transcript_files(&project_id)
                .map_err(|err| map_transcript_error(err, &project, None))
        })
        .await?;

        Ok(group_conversations(summaries)
            .into_iter()
            .map(|summary| ConversationSummary {
                session_id: summary.session_id,
                start_time: summary.start_time.map(format_time),
                last_time: summary.last_time.map(format_time),
                message_count: summary.message_count,
                last_message_preview: summary.last_preview,
            })
            .collect())
    }

    async fn read_records(&self, project: &str, session_id: &str) -> Result<Vec<Value>, RelayError> {
        let store = self.store.clone();
        let project = project.to_string();
        let session_id = session_id.to_string();
        run_blocking(move || {
            let project_id = store
                .resolve_project_directory(&project)
                .ok_or_else(|| RelayError::ProjectNotFound {
                    project: project.clone(),
                })?;
            store
                .read_transcript(&project_id, &session_id)
                .map_err(|err| map_transcript_error(err, &project, Some(&session_id)))?
                .ok_or(RelayError::TranscriptNotFound {
                    project,
                    session_id,
                })
        })
        .await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RelayError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| RelayError::StreamError {
            message: format!("transcript task failed: {err}"),
        })?
}

fn map_transcript_error(err: TranscriptError, project: &str, session_id: Option<&str>) -> RelayError {
    match err {
        TranscriptError::ProjectNotFound(_) => RelayError::ProjectNotFound {
            project: project.to_string(),
        },
        TranscriptError::InvalidSessionId(id) => {
            RelayError::invalid_request(format!("invalid session id: {id}"))
        }
        TranscriptError::Io { .. } => {
            tracing::warn!(project, session_id, error = %err, "transcript read failed");
            RelayError::StreamError {
                message: err.to_string(),
            }
        }
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_transcripts::ClaudeProjectsStore;
    use std::fs;
    use tempfile::TempDir;

    fn reconciler(root: &TempDir) -> HistoryReconciler {
        HistoryReconciler::new(Arc::new(ClaudeProjectsStore::new(root.path())))
    }

    #[tokio::test]
    async fn load_wraps_records_as_claude_json() {
        let root = TempDir::new().expect("tempdir");
        let project = root.path().join("-work-app");
        fs::create_dir_all(&project).expect("mkdir");
        fs::write(
            project.join("s1.jsonl"),
            "{\"type\":\"user\",\"uuid\":\"u1\"}\n{\"type\":\"assistant\",\"uuid\":\"a1\"}\n",
        )
        .expect("write");

        let events = reconciler(&root).load("/work/app", "s1").await.expect("load");

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.event_type() == "claude_json"));
        assert_ne!(events[0].message_id(), events[1].message_id());
        match &events[1] {
            StreamEvent::ClaudeJson { data, .. } => assert_eq!(data["uuid"], "a1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_reports_missing_project_and_transcript() {
        let root = TempDir::new().expect("tempdir");
        fs::create_dir_all(root.path().join("-work-app")).expect("mkdir");
        let history = reconciler(&root);

        let err = history.load("/elsewhere", "s1").await.expect_err("no project");
        assert!(matches!(err, RelayError::ProjectNotFound { .. }));

        let err = history.load("/work/app", "s1").await.expect_err("no transcript");
        assert!(matches!(err, RelayError::TranscriptNotFound { .. }));
    }

    #[tokio::test]
    async fn list_conversations_groups_continuations() {
        let root = TempDir::new().expect("tempdir");
        let project = root.path().join("-work-app");
        fs::create_dir_all(&project).expect("mkdir");
        let line = |id: &str| {
            format!(
                "{{\"type\":\"user\",\"uuid\":\"{id}\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"message\":{{\"content\":\"{id}\"}}}}\n"
            )
        };
        fs::write(project.join("early.jsonl"), line("1") + &line("2")).expect("write");
        fs::write(project.join("later.jsonl"), line("1") + &line("2") + &line("3")).expect("write");

        let conversations = reconciler(&root)
            .list_conversations("-work-app")
            .await
            .expect("list");

        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].session_id, "later");
        assert_eq!(conversations[0].message_count, 3);
        assert_eq!(conversations[0].last_message_preview.as_deref(), Some("3"));
        assert_eq!(
            conversations[0].start_time.as_deref(),
            Some("2025-01-01T00:00:00.000Z")
        );
    }
}
