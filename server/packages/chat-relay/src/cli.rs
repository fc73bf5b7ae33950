use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::build_version;
use crate::config::{RelayConfig, DEFAULT_HOST, DEFAULT_PORT};
use crate::router::{build_router_with_state, shutdown_sessions, AppState};

#[derive(Parser, Debug)]
#[command(name = "chat-relay", bin_name = "chat-relay")]
#[command(about = "Browser chat relay for the Claude Code CLI", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct ChatRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Path to the claude binary. Defaults to CHAT_RELAY_CLAUDE_BIN, then PATH.
    #[arg(long)]
    claude_bin: Option<PathBuf>,

    /// Directory holding per-project transcripts. Defaults to ~/.claude/projects.
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 30 * 60)]
    idle_timeout_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    fn to_config(&self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            host: self.host.clone(),
            port: self.port,
            claude_bin: self.claude_bin.clone(),
            projects_dir: self.projects_dir.clone().unwrap_or(defaults.projects_dir),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            cors_allow_origins: self.cors_allow_origin.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid idle timeout: must be greater than zero")]
    InvalidIdleTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_chat_relay() -> Result<(), CliError> {
    let ChatRelayCli { command } = ChatRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(&args.to_config()),
    }
}

fn run_server(config: &RelayConfig) -> Result<(), CliError> {
    if config.idle_timeout.is_zero() {
        return Err(CliError::InvalidIdleTimeout);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    let config = config.clone();
    runtime.block_on(async move {
        let state = Arc::new(AppState::from_config(&config));
        let (mut router, state) = build_router_with_state(state);
        router = router.layer(build_cors_layer(&config.cors_allow_origins)?);

        let addr = config.addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            projects_dir = %config.projects_dir.display(),
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "server listening"
        );
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(allow_origins: &[String]) -> Result<CorsLayer, CliError> {
    let mut origins = Vec::new();
    for origin in allow_origins {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }

    let cors = if origins.is_empty() {
        // No origins configured: cross-origin requests are refused.
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_map_onto_config() {
        let cli = ChatRelayCli::try_parse_from([
            "chat-relay",
            "server",
            "--port",
            "4000",
            "--claude-bin",
            "/usr/local/bin/claude",
            "--projects-dir",
            "/tmp/projects",
            "--idle-timeout-secs",
            "90",
            "-O",
            "http://localhost:5173",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command;
        let config = args.to_config();

        assert_eq!(config.addr(), "127.0.0.1:4000");
        assert_eq!(config.claude_bin, Some(PathBuf::from("/usr/local/bin/claude")));
        assert_eq!(config.projects_dir, PathBuf::from("/tmp/projects"));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.cors_allow_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn rejects_malformed_cors_origin() {
        let err = build_cors_layer(&["bad\norigin".to_string()]).expect_err("invalid origin");
        assert!(matches!(err, CliError::InvalidCorsOrigin(_)));
        assert!(build_cors_layer(&[]).is_ok());
    }
}
