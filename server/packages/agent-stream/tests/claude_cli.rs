#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_relay_agent_stream::{
    AgentMessageKind, ClaudeCliProducer, EventProducer, ExecuteRequest, ProducerError,
};
use futures::StreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("claude");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

#[tokio::test]
async fn parses_stream_json_lines_and_skips_garbage() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"abc"}'
echo 'not json'
echo ''
echo '{"type":"assistant","session_id":"abc","message":{"content":[]}}'
echo '{"type":"result","subtype":"success","session_id":"abc"}'"#,
    );
    let producer = ClaudeCliProducer::new(script);

    let items: Vec<_> = producer
        .execute(ExecuteRequest::new("hello", CancellationToken::new()))
        .collect()
        .await;

    let kinds: Vec<_> = items
        .iter()
        .map(|item| item.as_ref().expect("message").kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            AgentMessageKind::System,
            AgentMessageKind::Assistant,
            AgentMessageKind::Result
        ]
    );
}

#[tokio::test]
async fn passes_prompt_and_runs_in_working_directory() {
    let dir = TempDir::new().expect("tempdir");
    let work = TempDir::new().expect("workdir");
    let script = write_script(
        dir.path(),
        r#"printf '{"type":"assistant","args":"%s","cwd":"%s"}\n' "$*" "$(pwd)""#,
    );
    let producer = ClaudeCliProducer::new(script);
    let mut request = ExecuteRequest::new("hello", CancellationToken::new());
    request.resume_id = Some("s-1".to_string());
    request.working_directory = Some(work.path().to_path_buf());

    let items: Vec<_> = producer.execute(request).collect().await;
    assert_eq!(items.len(), 1);
    let value = items[0].as_ref().expect("message").as_value().clone();
    assert_eq!(
        value["args"],
        "-p --output-format stream-json --verbose --resume s-1 -- hello"
    );
    let cwd = fs::canonicalize(value["cwd"].as_str().expect("cwd")).expect("canonical cwd");
    assert_eq!(cwd, fs::canonicalize(work.path()).expect("canonical workdir"));
}

#[tokio::test]
async fn dash_prompt_reaches_cli_after_separator() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"for last; do :; done
printf '{"type":"assistant","last":"%s","args":"%s"}\n' "$last" "$*""#,
    );
    let producer = ClaudeCliProducer::new(script);

    let items: Vec<_> = producer
        .execute(ExecuteRequest::new("--help", CancellationToken::new()))
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    let value = items[0].as_ref().expect("message").as_value().clone();
    assert_eq!(value["last"], "--help");
    assert_eq!(
        value["args"],
        "-p --output-format stream-json --verbose -- --help"
    );
}

#[tokio::test]
async fn non_zero_exit_reports_code_and_stderr_tail() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "echo 'not logged in' >&2\nexit 3");
    let producer = ClaudeCliProducer::new(script);

    let items: Vec<_> = producer
        .execute(ExecuteRequest::new("hello", CancellationToken::new()))
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(ProducerError::Exited { code, message }) => {
            assert_eq!(*code, Some(3));
            assert_eq!(message, "Claude CLI exited with code 3: not logged in");
        }
        other => panic!("unexpected item: {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_kills_silent_process() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        "echo '{\"type\":\"system\",\"session_id\":\"abc\"}'\nexec sleep 30",
    );
    let producer = ClaudeCliProducer::new(script);
    let cancel = CancellationToken::new();
    let mut stream = producer.execute(ExecuteRequest::new("hello", cancel.clone()));

    let first = stream.next().await.expect("first item").expect("message");
    assert_eq!(first.session_id(), Some("abc"));

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("cancellation should not wait for the process");
    assert!(matches!(next, Some(Err(ProducerError::Cancelled))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let dir = TempDir::new().expect("tempdir");
    let producer = ClaudeCliProducer::new(dir.path().join("does-not-exist"));

    let items: Vec<_> = producer
        .execute(ExecuteRequest::new("hello", CancellationToken::new()))
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(ProducerError::Spawn { .. })));
}
