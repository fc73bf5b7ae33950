use std::path::PathBuf;
use std::time::Duration;

use chat_relay_agent_stream::ClaudeCliProducer;
use chat_relay_transcripts::ClaudeProjectsStore;

use crate::session_manager::DEFAULT_IDLE_TIMEOUT;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Explicit agent binary. When unset, `CHAT_RELAY_CLAUDE_BIN` and then
    /// `PATH` are consulted.
    pub claude_bin: Option<PathBuf>,
    pub projects_dir: PathBuf,
    pub idle_timeout: Duration,
    pub cors_allow_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            claude_bin: None,
            projects_dir: default_projects_dir(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cors_allow_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn producer(&self) -> ClaudeCliProducer {
        match &self.claude_bin {
            Some(program) => ClaudeCliProducer::new(program),
            None => ClaudeCliProducer::from_env(),
        }
    }

    pub fn transcript_store(&self) -> ClaudeProjectsStore {
        ClaudeProjectsStore::new(&self.projects_dir)
    }
}

pub fn default_projects_dir() -> PathBuf {
    ClaudeProjectsStore::default_root()
        .unwrap_or_else(|| PathBuf::from(".claude").join("projects"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_binary_wins() {
        let config = RelayConfig {
            claude_bin: Some(PathBuf::from("/opt/claude/bin/claude")),
            ..RelayConfig::default()
        };
        assert_eq!(
            config.producer().program(),
            std::path::Path::new("/opt/claude/bin/claude")
        );
        assert_eq!(config.addr(), "127.0.0.1:3001");
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
    }
}
