use std::{io, path::PathBuf, process::ExitStatus};

use thiserror::Error;

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid quota value {0}, expected 1..=i64::MAX or -1 to remove")]
    InvalidQuotaValue(i64),

    #[error("not configured: {0}")]
    NotInState(String),

    #[error("no prior alert set for {0}")]
    NoAlertConfigured(String),

    #[error("`{command}` failed: {status}")]
    BackendCommandFailed { command: String, status: String },

    #[error("pinned map {} not accessible: {reason}", path.display())]
    MapAccess { path: PathBuf, reason: String },

    #[error("failed to create map at {}: {source}", path.display())]
    MapCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("map {map} {op} failed: {source}")]
    MapOperation {
        map: &'static str,
        op: &'static str,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("stats parse error: {0}")]
    StatsParse(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ControllerError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ControllerError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn backend(command: impl Into<String>, status: ExitStatus) -> Self {
        ControllerError::BackendCommandFailed {
            command: command.into(),
            status: status.to_string(),
        }
    }
}
