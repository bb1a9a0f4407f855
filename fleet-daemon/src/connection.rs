//! Host links: one persistent connection per agent, the job table that
//! routes inbound messages, and the registry the executor dispatches through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{broadcast, mpsc};

use fleet_core::ObjectId;

use crate::error::DaemonError;
use crate::job::{JobHandler, JobId, JobOutcome, OutputSource};
use crate::protocol::{AgentCommand, AgentMessage, OutputType, ScriptRequest};

struct JobEntry {
    handler: Box<dyn JobHandler>,
    stdout: OutputType,
    stderr: OutputType,
}

impl JobEntry {
    fn decode(&self, source: OutputSource, data: String) -> Option<Vec<u8>> {
        let encoding = match source {
            OutputSource::Stdout => self.stdout,
            OutputSource::Stderr => self.stderr,
        };
        match encoding {
            OutputType::Binary => match STANDARD.decode(data.as_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping undecodable output chunk");
                    None
                }
            },
            OutputType::Text => Some(data.into_bytes()),
            OutputType::None => None,
        }
    }
}

/// Server side of one agent link.
pub struct HostConnection {
    host: ObjectId,
    host_name: String,
    outbound: mpsc::UnboundedSender<AgentCommand>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    closed: AtomicBool,
}

impl HostConnection {
    /// Create a link; the receiver carries the commands to write to the agent.
    pub fn new(
        host: ObjectId,
        host_name: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AgentCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            host,
            host_name: host_name.into(),
            outbound: tx,
            jobs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn host(&self) -> ObjectId {
        self.host
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.jobs().len()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn down(&self) -> DaemonError {
        DaemonError::HostDown {
            host: self.host_name.clone(),
        }
    }

    /// Register `handler` under a fresh id and send `run_script`.
    pub fn start(
        &self,
        script: ScriptRequest,
        handler: Box<dyn JobHandler>,
    ) -> Result<JobId, DaemonError> {
        let id = JobId::next();
        {
            let mut jobs = self.jobs();
            if self.is_closed() {
                return Err(self.down());
            }
            jobs.insert(
                id,
                JobEntry {
                    handler,
                    stdout: script.stdout_type,
                    stderr: script.stderr_type,
                },
            );
        }

        if self.outbound.send(AgentCommand::RunScript { id, script }).is_err() {
            self.jobs().remove(&id);
            return Err(self.down());
        }
        tracing::debug!(host = %self.host_name, job = %id, "job started");
        Ok(id)
    }

    /// Route one inbound agent message to its job.
    pub fn dispatch(&self, message: AgentMessage) {
        let (id, outcome) = match message {
            AgentMessage::Hello { host } => {
                tracing::warn!(host = %self.host_name, hello = %host, "ignoring repeated hello");
                return;
            }
            AgentMessage::Data { id, source, data } => {
                let mut jobs = self.jobs();
                let Some(entry) = jobs.get_mut(&id) else {
                    tracing::debug!(host = %self.host_name, job = %id, "data for unknown job");
                    return;
                };
                if let Some(chunk) = entry.decode(source, data) {
                    entry.handler.on_data(source, &chunk);
                }
                return;
            }
            AgentMessage::Success { id, code } => (id, JobOutcome::Success { exit_code: code }),
            AgentMessage::Failure { id } => (id, JobOutcome::Failure),
        };

        let entry = self.jobs().remove(&id);
        match entry {
            Some(mut entry) => entry.handler.on_terminal(outcome),
            None => tracing::debug!(host = %self.host_name, job = %id, "terminal for unknown job"),
        }
    }

    /// Cancel a job locally and ask the agent to kill it.
    pub fn kill(&self, id: JobId) {
        let entry = self.jobs().remove(&id);
        if let Some(mut entry) = entry {
            entry.handler.on_kill();
            let _ = self.outbound.send(AgentCommand::Kill { id });
        }
    }

    /// Mark the link unusable and fail every outstanding job.
    pub fn close(&self) {
        let drained: Vec<JobEntry> = {
            let mut jobs = self.jobs();
            self.closed.store(true, Ordering::Release);
            jobs.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            tracing::info!(host = %self.host_name, jobs = drained.len(), "failing outstanding jobs");
        }
        for mut entry in drained {
            entry.handler.on_terminal(JobOutcome::TransportLost);
        }
    }
}

/// Pump one agent link until EOF, a write failure or shutdown, then close it.
///
/// `lines` must already be positioned after the hello line.
pub async fn serve_link<R, W>(
    conn: Arc<HostConnection>,
    mut lines: Lines<R>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<AgentCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            command = outbound.recv() => {
                let Some(command) = command else { break };
                if let Err(err) = write_command(&mut writer, &command).await {
                    tracing::warn!(host = %conn.host_name(), error = %err, "agent write failed");
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentMessage>(&line) {
                        Ok(message) => conn.dispatch(message),
                        Err(err) => {
                            tracing::warn!(host = %conn.host_name(), error = %err, "invalid agent message");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(host = %conn.host_name(), error = %err, "agent read failed");
                    break;
                }
            },
        }
    }
    conn.close();
}

async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &AgentCommand,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_vec(command)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| crate::error::io_err("agent link write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| crate::error::io_err("agent link flush", e))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Where the executor and the runtime send jobs.
pub trait JobDispatcher: Send + Sync {
    /// `true` when the host has a live, open link.
    fn is_up(&self, host: ObjectId) -> bool;

    fn run_script(
        &self,
        host: ObjectId,
        script: ScriptRequest,
        handler: Box<dyn JobHandler>,
    ) -> Result<JobId, DaemonError>;

    fn kill(&self, host: ObjectId, job: JobId);
}

/// Live links keyed by host object id.
#[derive(Default)]
pub struct ConnectionRegistry {
    hosts: RwLock<HashMap<ObjectId, Arc<HostConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a link, closing any link it replaces.
    pub fn register(&self, conn: Arc<HostConnection>) {
        let replaced = self
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.host(), conn.clone());
        if let Some(old) = replaced {
            tracing::info!(host = %conn.host_name(), "agent reconnected, closing previous link");
            old.close();
        }
    }

    /// Remove `conn` unless it was already replaced by a newer link.
    pub fn remove_if_same(&self, conn: &Arc<HostConnection>) {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        if hosts
            .get(&conn.host())
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            hosts.remove(&conn.host());
        }
    }

    pub fn get(&self, host: ObjectId) -> Option<Arc<HostConnection>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host)
            .cloned()
    }

    /// `(host id, host name)` of every registered link, by id.
    pub fn connected(&self) -> Vec<(ObjectId, String)> {
        let mut hosts: Vec<(ObjectId, String)> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|conn| (conn.host(), conn.host_name().to_string()))
            .collect();
        hosts.sort();
        hosts
    }
}

impl JobDispatcher for ConnectionRegistry {
    fn is_up(&self, host: ObjectId) -> bool {
        self.get(host).is_some_and(|conn| !conn.is_closed())
    }

    fn run_script(
        &self,
        host: ObjectId,
        script: ScriptRequest,
        handler: Box<dyn JobHandler>,
    ) -> Result<JobId, DaemonError> {
        match self.get(host) {
            Some(conn) => conn.start(script, handler),
            None => Err(DaemonError::HostDown {
                host: host.to_string(),
            }),
        }
    }

    fn kill(&self, host: ObjectId, job: JobId) {
        if let Some(conn) = self.get(host) {
            conn.kill(job);
        }
    }
}
