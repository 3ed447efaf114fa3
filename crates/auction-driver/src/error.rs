//! Error types for the auction scenario driver

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can stop a scenario run
#[derive(Error, Debug)]
pub enum DriverError {
    /// Scenario file could not be parsed
    #[error("Malformed scenario at line {line}: {reason}")]
    MalformedScenario { line: usize, reason: String },

    /// A participant was launched twice
    #[error("Participant '{0}' is already launched")]
    DuplicateLaunch(String),

    /// A command targets a participant that was never launched
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// A launch event names a participant missing from the port table
    #[error("No port assigned to participant '{0}'")]
    NoPortAssigned(String),

    /// The OS refused to start a process
    #[error("Failed to spawn {what}: {source}")]
    ProcessSpawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// A log file could not be created
    #[error("Failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing a command to a client's stdin failed
    #[error("Failed to deliver command to '{participant}': {source}")]
    CommandDelivery {
        participant: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a command to a client's stdin did not finish in time
    #[error("Command delivery to '{participant}' timed out after {timeout:?}")]
    CommandTimeout {
        participant: String,
        timeout: Duration,
    },

    /// The server never signalled readiness
    #[error("Server not ready: {0}")]
    ServerNotReady(String),

    /// Invalid driver configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file is not valid JSON
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        DriverError::MalformedScenario {
            line,
            reason: reason.into(),
        }
    }
}

/// Result type alias using DriverError
pub type DriverResult<T> = Result<T, DriverError>;
