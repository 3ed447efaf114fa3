//! Driver configuration.
//!
//! Every field has a default matching the classic Java auction setup, so an
//! empty JSON object (or no config file at all) is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DriverError, DriverResult};
use crate::readiness::Readiness;

/// A program plus its leading arguments
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build a tokio command with the configured program and arguments
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Configuration for one driver run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Server launch command, stdout/stderr go to `server.log`/`server.err`
    pub server: CommandSpec,
    /// Client launch command; host, port and participant name are appended
    pub client: CommandSpec,
    /// Host passed to clients and used in client log file names
    pub client_host: String,
    /// Directory for all log files. Must already exist.
    pub logs_dir: PathBuf,
    /// How to decide the server is ready for clients
    pub readiness: Readiness,
    /// Bound on a single stdin write, unbounded when absent
    pub command_timeout_ms: Option<u64>,
    /// Bound on each client's exit during the drain, unbounded when absent
    pub exit_timeout_ms: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            server: CommandSpec::new("java", &["ServerLauncher", "../auct_conf.txt"]),
            client: CommandSpec::new("java", &["ClientLauncher"]),
            client_host: "localhost".to_string(),
            logs_dir: PathBuf::from("logs"),
            readiness: Readiness::default(),
            command_timeout_ms: None,
            exit_timeout_ms: None,
        }
    }
}

impl DriverConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> DriverResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: DriverConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot launch anything
    pub fn validate(&self) -> DriverResult<()> {
        if self.server.program.trim().is_empty() {
            return Err(DriverError::Config("server.program is empty".into()));
        }
        if self.client.program.trim().is_empty() {
            return Err(DriverError::Config("client.program is empty".into()));
        }
        if self.client_host.trim().is_empty() {
            return Err(DriverError::Config("client_host is empty".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn exit_timeout(&self) -> Option<Duration> {
        self.exit_timeout_ms.map(Duration::from_millis)
    }
}
