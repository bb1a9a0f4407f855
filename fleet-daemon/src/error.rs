use std::path::PathBuf;

use thiserror::Error;

use crate::coordinator::DeploymentStatus;

/// Error surface for the coordinator, daemon runtime and operator protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] fleet_core::StoreError),

    #[error("plan error: {0}")]
    Plan(#[from] fleet_plan::PlanError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("cannot {op} while deployment is {status}")]
    InvalidState {
        op: &'static str,
        status: DeploymentStatus,
    },

    #[error("no deployment unit at index {index}")]
    UnitNotFound { index: usize },

    #[error("host {host} is not connected")]
    HostDown { host: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
