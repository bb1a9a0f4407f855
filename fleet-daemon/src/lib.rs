//! Deployment daemon: coordinator state machine, execution engine, host
//! agent links and the operator socket.

pub mod config;
pub mod connection;
pub mod coordinator;
mod error;
pub mod executor;
pub mod job;
pub mod paths;
pub mod protocol;
pub mod publisher;
mod runtime;
pub mod scripts;

pub use config::DaemonConfig;
pub use connection::{ConnectionRegistry, HostConnection, JobDispatcher};
pub use coordinator::{Coordinator, DeploymentEvent, DeploymentStatus, Run, Snapshot};
pub use error::DaemonError;
pub use executor::Executor;
pub use job::{DeployJob, JobHandler, JobId, JobOutcome, LogJob, LogStreams, OutputSource};
pub use protocol::{
    open_stream, request, request_shutdown, request_status, send_request, DaemonRequest,
    DaemonResponse,
};
pub use publisher::{Deployment, Publisher};
pub use runtime::{handle_command, run, start_blocking, Daemon};
pub use scripts::ScriptCatalog;
