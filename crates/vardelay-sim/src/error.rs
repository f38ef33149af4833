use std::io;
use std::net::Ipv4Addr;
use std::process::Output;

use thiserror::Error;

/// An external command that could not be launched or exited non-zero.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with code {code:?}:\n{stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn launch(command: impl Into<String>, source: io::Error) -> Self {
        CommandError::Launch {
            command: command.into(),
            source,
        }
    }

    /// Builds a `Failed` error from the output of a finished command.
    pub fn failed(command: impl Into<String>, output: &Output) -> Self {
        CommandError::Failed {
            command: command.into(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub fn command(&self) -> &str {
        match self {
            CommandError::Launch { command, .. } | CommandError::Failed { command, .. } => command,
        }
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(
        "{requested} flows requested but supernet {supernet}/{prefix} holds at most {capacity} flows"
    )]
    AddressSpaceExhausted {
        supernet: Ipv4Addr,
        prefix: u8,
        requested: usize,
        capacity: usize,
    },

    #[error("supernet {supernet}/{prefix} is invalid: prefix must be in 1..=30")]
    InvalidSupernet { supernet: Ipv4Addr, prefix: u8 },

    #[error(
        "delay walk cannot move from {value_us}us: step {step_us}us leaves [0, {max_delay_us}us] in both directions"
    )]
    InfeasibleDelayWalk {
        value_us: u64,
        step_us: u64,
        max_delay_us: u64,
    },

    #[error("invalid delay schedule parameters: {0}")]
    InvalidDelayWalk(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("interrupted")]
    Interrupted,
}

impl SimError {
    /// True for errors caused by the run's parameters rather than the host.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SimError::AddressSpaceExhausted { .. }
                | SimError::InvalidSupernet { .. }
                | SimError::InfeasibleDelayWalk { .. }
                | SimError::InvalidDelayWalk(_)
        )
    }
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;
