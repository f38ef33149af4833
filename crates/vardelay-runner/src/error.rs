use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vardelay_sim::{CommandError, SimError};

/// Broad category of a failed run, printed ahead of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Readiness,
    Command,
    Interrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Readiness => "Readiness",
            ErrorKind::Command => "Command",
            ErrorKind::Interrupted => "Interrupted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to open metadata {}: {source}", path.display())]
    MetadataRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load metadata {}: {source}", path.display())]
    MetadataFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("malformed start schedule: {0}")]
    StartSchedule(String),

    #[error("path of scheme `{scheme}` does not exist: {}", path.display())]
    MissingScheme { scheme: String, path: PathBuf },

    #[error("required tools not found: {}", tools.join(", "))]
    MissingTools { tools: Vec<String> },

    #[error(
        "server of flow {flow} not listening on port {port} after {waited:?}; last `ss` output:\n{last_output}"
    )]
    NotReady {
        flow: usize,
        port: u16,
        waited: Duration,
        last_output: String,
    },

    #[error("capture {capture} exited without reporting kernel drops:\n{stderr}")]
    MissingDropCount { capture: String, stderr: String },

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("{what}: {source}")]
    Process {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("interrupted")]
    Interrupted,
}

impl From<CommandError> for RunError {
    fn from(err: CommandError) -> Self {
        RunError::Sim(SimError::Command(err))
    }
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::MetadataRead { .. }
            | RunError::MetadataFormat { .. }
            | RunError::Metadata(_)
            | RunError::StartSchedule(_)
            | RunError::MissingScheme { .. }
            | RunError::MissingTools { .. } => ErrorKind::Configuration,
            RunError::NotReady { .. } => ErrorKind::Readiness,
            RunError::Interrupted | RunError::Sim(SimError::Interrupted) => ErrorKind::Interrupted,
            RunError::Sim(e) if e.is_configuration() => ErrorKind::Configuration,
            RunError::MissingDropCount { .. }
            | RunError::Spawn { .. }
            | RunError::Process { .. }
            | RunError::ThreadPanic(_)
            | RunError::Sim(_) => ErrorKind::Command,
        }
    }
}

pub type Result<T, E = RunError> = std::result::Result<T, E>;
