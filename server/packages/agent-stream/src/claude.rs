use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::{AgentMessage, EventProducer, EventStream, ExecuteRequest, ProducerError};

pub const CLAUDE_BIN_ENV: &str = "CHAT_RELAY_CLAUDE_BIN";

const CHANNEL_CAPACITY: usize = 64;
const STDERR_TAIL_LINES: usize = 20;
const RAW_PREVIEW_BYTES: usize = 200;

/// Runs `claude -p <prompt> --output-format stream-json --verbose` and yields
/// each stdout line as an [`AgentMessage`].
#[derive(Debug, Clone)]
pub struct ClaudeCliProducer {
    program: PathBuf,
}

impl ClaudeCliProducer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolves the binary from `CHAT_RELAY_CLAUDE_BIN`, then `PATH`.
    pub fn from_env() -> Self {
        if let Some(program) = std::env::var_os(CLAUDE_BIN_ENV).filter(|value| !value.is_empty()) {
            return Self::new(program);
        }
        Self::new(find_in_path("claude").unwrap_or_else(|| PathBuf::from("claude")))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command_args(request: &ExecuteRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(resume_id) = request.resume_id.as_ref().filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(resume_id.clone());
        }
        if let Some(tools) = request.allowed_tools.as_ref().filter(|tools| !tools.is_empty()) {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        if let Some(mode) = request.permission_mode.as_ref().filter(|mode| !mode.is_empty()) {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        // The prompt is positional and comes from the browser; never let it
        // parse as an option.
        args.push("--".to_string());
        args.push(request.prompt.clone());
        args
    }
}

impl EventProducer for ClaudeCliProducer {
    fn execute(&self, request: ExecuteRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let program = self.program.clone();
        tokio::spawn(async move {
            if let Err(err) = drive(&program, request, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

type Sender = mpsc::Sender<Result<AgentMessage, ProducerError>>;

async fn drive(program: &Path, request: ExecuteRequest, tx: &Sender) -> Result<(), ProducerError> {
    let spawn_start = Instant::now();
    let args = ClaudeCliProducer::command_args(&request);

    let mut command = Command::new(program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &request.working_directory {
        command.current_dir(dir);
    }

    tracing::info!(
        program = ?program,
        working_directory = ?request.working_directory,
        resume = request.resume_id.is_some(),
        "spawning claude process"
    );

    let mut child = command.spawn().map_err(|err| {
        tracing::error!(program = ?program, error = %err, "failed to spawn claude process");
        ProducerError::Spawn {
            command: format_command_for_display(program, &args),
            error: err,
        }
    })?;

    tracing::info!(
        pid = child.id().unwrap_or(0),
        elapsed_ms = spawn_start.elapsed().as_millis() as u64,
        "claude process spawned"
    );

    let stdout = child.stdout.take().ok_or(ProducerError::MissingStdout)?;
    let stderr_tail = child.stderr.take().map(spawn_stderr_loop);

    let mut lines = BufReader::new(stdout).lines();
    let mut line_count: u64 = 0;
    let cancel = request.cancel.clone();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(lines = line_count, "claude process cancelled");
                let _ = child.kill().await;
                return Err(ProducerError::Cancelled);
            }
            _ = tx.closed() => {
                tracing::debug!(lines = line_count, "event consumer dropped, killing claude process");
                let _ = child.kill().await;
                return Ok(());
            }
            line = lines.next_line() => line.map_err(ProducerError::Read)?,
        };

        let Some(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        line_count += 1;

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                if tx.send(Ok(AgentMessage::new(value))).await.is_err() {
                    let _ = child.kill().await;
                    return Ok(());
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    line_number = line_count,
                    raw = %preview(trimmed),
                    "claude stdout: invalid JSON"
                );
            }
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ProducerError::Cancelled);
        }
        status = child.wait() => status.map_err(ProducerError::Read)?,
    };

    let tail = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => VecDeque::new(),
    };

    tracing::info!(
        code = status.code(),
        lines = line_count,
        age_ms = spawn_start.elapsed().as_millis() as u64,
        "claude process exited"
    );

    if status.success() {
        return Ok(());
    }

    let code = status.code();
    let mut message = match code {
        Some(code) => format!("Claude CLI exited with code {code}"),
        None => "Claude CLI terminated by signal".to_string(),
    };
    if !tail.is_empty() {
        message.push_str(": ");
        message.push_str(&Vec::from(tail).join("\n"));
    }
    Err(ProducerError::Exited { code, message })
}

fn spawn_stderr_loop(stderr: ChildStderr) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("claude stderr: {}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

fn preview(raw: &str) -> String {
    if raw.len() <= RAW_PREVIEW_BYTES {
        return raw.to_string();
    }
    let mut end = RAW_PREVIEW_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

fn find_in_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(binary_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let candidate_exe = path.join(format!("{binary_name}.exe"));
            if candidate_exe.is_file() {
                return Some(candidate_exe);
            }
        }
    }
    None
}

fn format_command_for_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn args_include_optional_flags_only_when_set() {
        let mut request = ExecuteRequest::new("hello", CancellationToken::new());
        assert_eq!(
            ClaudeCliProducer::command_args(&request),
            vec!["-p", "--output-format", "stream-json", "--verbose", "--", "hello"]
        );

        request.resume_id = Some("abc".to_string());
        request.allowed_tools = Some(vec!["Read".to_string(), "Bash".to_string()]);
        request.permission_mode = Some("acceptEdits".to_string());
        let args = ClaudeCliProducer::command_args(&request);
        assert_eq!(
            &args[4..],
            &[
                "--resume",
                "abc",
                "--allowedTools",
                "Read,Bash",
                "--permission-mode",
                "acceptEdits",
                "--",
                "hello"
            ]
        );
    }

    #[test]
    fn prompt_starting_with_dash_stays_positional() {
        let request =
            ExecuteRequest::new("--dangerously-skip-permissions", CancellationToken::new());
        let args = ClaudeCliProducer::command_args(&request);
        let separator = args.iter().position(|arg| arg == "--").expect("separator");
        assert_eq!(separator, args.len() - 2);
        assert_eq!(args[separator + 1], "--dangerously-skip-permissions");
        assert_eq!(
            args.iter()
                .filter(|arg| arg.as_str() == "--dangerously-skip-permissions")
                .count(),
            1
        );
    }

    #[test]
    fn empty_tool_list_is_omitted() {
        let mut request = ExecuteRequest::new("hi", CancellationToken::new());
        request.allowed_tools = Some(Vec::new());
        assert!(!ClaudeCliProducer::command_args(&request).contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn display_quotes_arguments() {
        let display = format_command_for_display(
            Path::new("/usr/bin/claude"),
            &["-p".to_string(), "it's".to_string()],
        );
        assert_eq!(display, r#"'/usr/bin/claude' '-p' 'it'\''s'"#);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let raw = "é".repeat(150);
        let shown = preview(&raw);
        assert!(shown.ends_with("..."));
        assert!(shown.len() <= RAW_PREVIEW_BYTES + 3);
    }
}
