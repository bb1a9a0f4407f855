use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use fleet_core::{FileStore, ObjectClass, ObjectId, ObjectStore};
use fleet_plan::content_digest;

use crate::config::DaemonConfig;
use crate::connection::{serve_link, ConnectionRegistry, HostConnection, JobDispatcher};
use crate::coordinator::DeploymentEvent;
use crate::error::{io_err, DaemonError};
use crate::executor::Executor;
use crate::job::{LogJob, LogStreams};
use crate::paths::{fleet_root, socket_path};
use crate::protocol::{
    AgentMessage, DaemonRequest, DaemonResponse, OutputType, ScriptRequest, StdinType,
};
use crate::publisher::Deployment;
use crate::scripts::{ScriptCatalog, LOG_SCRIPT};

/// Everything the daemon tasks share.
pub struct Daemon {
    home: PathBuf,
    config: DaemonConfig,
    store: Arc<dyn ObjectStore>,
    deployment: Arc<Deployment>,
    registry: Arc<ConnectionRegistry>,
    executor: Arc<Executor>,
    scripts: ScriptCatalog,
    log_streams: LogStreams,
    next_stream: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Daemon {
    pub fn new(home: &Path, config: DaemonConfig, store: Arc<dyn ObjectStore>) -> Self {
        let deployment = Arc::new(Deployment::new(config.event_buffer));
        let registry = Arc::new(ConnectionRegistry::new());
        let scripts = ScriptCatalog::new(&config.scripts_dir);
        let executor = Arc::new(Executor::new(
            deployment.clone(),
            registry.clone(),
            store.clone(),
            scripts.clone(),
            config.interpreter.clone(),
        ));
        Self {
            home: home.to_path_buf(),
            config,
            store,
            deployment,
            registry,
            executor,
            scripts,
            log_streams: LogStreams::new(),
            next_stream: AtomicU64::new(1),
            started_at: Utc::now(),
        }
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = DaemonConfig::load_at(&home)?;
    let store_home = home.clone();
    let store = tokio::task::spawn_blocking(move || FileStore::init_at(&store_home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("store open join error: {err}")))??;
    let daemon = Arc::new(Daemon::new(&home, config, Arc::new(store)));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = socket_server_task(daemon, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let agent_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = agent_server_task(daemon, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, agent_result, signal_result) =
        tokio::join!(socket_handle, agent_handle, signal_handle);

    handle_join("socket_server", socket_result)?;
    handle_join("agent_server", agent_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Host agents
// ---------------------------------------------------------------------------

async fn agent_server_task(
    daemon: Arc<Daemon>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let addr = daemon.config.agent_listen.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| io_err(&addr, e))?;
    tracing::info!(addr = %addr, "listening for host agents");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "agent accept failed");
                        continue;
                    }
                };
                let daemon = daemon.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(err) = handle_agent(daemon, stream, peer, shutdown_rx).await {
                        tracing::warn!(peer = %peer, error = %err, "agent link rejected");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_agent(
    daemon: Arc<Daemon>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(first) = lines
        .next_line()
        .await
        .map_err(|e| io_err(peer.to_string(), e))?
    else {
        return Ok(());
    };
    let host_name = match serde_json::from_str::<AgentMessage>(&first)? {
        AgentMessage::Hello { host } => host,
        other => {
            return Err(DaemonError::Protocol(format!(
                "expected hello from agent, got {other:?}"
            )))
        }
    };

    let store = daemon.store.clone();
    let lookup = host_name.clone();
    let host = tokio::task::spawn_blocking(move || resolve_host(store.as_ref(), &lookup))
        .await
        .map_err(|err| DaemonError::Protocol(format!("host lookup join error: {err}")))??
        .ok_or_else(|| DaemonError::Protocol(format!("unknown host '{host_name}'")))?;

    let (conn, outbound) = HostConnection::new(host, host_name.clone());
    daemon.registry.register(conn.clone());
    tracing::info!(host = %host_name, peer = %peer, "agent connected");

    serve_link(conn.clone(), lines, writer, outbound, shutdown_rx).await;

    daemon.registry.remove_if_same(&conn);
    tracing::info!(host = %host_name, "agent connection closed");
    Ok(())
}

fn resolve_host(store: &dyn ObjectStore, name: &str) -> Result<Option<ObjectId>, DaemonError> {
    Ok(store
        .list_newest_objects()?
        .into_iter()
        .find(|object| object.class() == ObjectClass::Host && object.name == name)
        .map(|object| object.id))
}

// ---------------------------------------------------------------------------
// Operator socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    daemon: Arc<Daemon>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = fleet_root(&daemon.home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let socket = socket_path(&daemon.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "operator socket ready");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = daemon.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    daemon: Arc<Daemon>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<DaemonRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        match request.cmd.as_str() {
            "subscribe" => return stream_events(&daemon, lines, writer, shutdown_tx.subscribe()).await,
            "journal" => {
                return stream_journal(&daemon, &request, lines, writer, shutdown_tx.subscribe())
                    .await
            }
            "shutdown" => {
                let _ = shutdown_tx.send(());
                write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true })))
                    .await?;
                break;
            }
            _ => {}
        }

        let response = match handle_command(&daemon, &request).await {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => DaemonResponse::error(err.to_string()),
        };
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Handle one request/response command.
pub async fn handle_command(daemon: &Daemon, request: &DaemonRequest) -> Result<Value, DaemonError> {
    let deployment = &daemon.deployment;
    match request.cmd.as_str() {
        "status" => Ok(build_status_payload(daemon).await),
        "plan" => {
            deployment
                .apply(|c| c.begin_plan().map(|events| ((), events)))
                .await?;

            let store = daemon.store.clone();
            let target = request.target;
            let result = tokio::task::spawn_blocking(move || fleet_plan::plan(store.as_ref(), target)).await;
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    let message = format!("plan task join error: {err}");
                    deployment.emit(|c| c.abort_plan(message.clone())).await;
                    return Err(DaemonError::Protocol(message));
                }
            };

            let failure = deployment
                .apply(|c| {
                    let (events, failure) = c.complete_plan(result);
                    Ok((failure, events))
                })
                .await?;
            if let Some(err) = failure {
                return Err(err.into());
            }
            let snapshot = deployment.read(|c| c.snapshot()).await;
            Ok(json!({
                "status": snapshot.status,
                "message": snapshot.message,
                "units": snapshot.units,
            }))
        }
        "toggle" => {
            let index = required(request.index, "toggle", "index")?;
            let enabled = required(request.enabled, "toggle", "enabled")?;
            deployment
                .apply(|c| c.toggle(index, enabled).map(|events| ((), events)))
                .await?;
            Ok(json!({ "index": index, "enabled": enabled }))
        }
        "start" => {
            let run = deployment.apply(|c| c.start()).await?;
            let generation = run.generation;
            let executor = daemon.executor.clone();
            tokio::spawn(async move { executor.execute(run).await });
            Ok(json!({ "generation": generation }))
        }
        "stop" => {
            deployment
                .apply(|c| c.stop().map(|events| ((), events)))
                .await?;
            Ok(json!({ "status": "idle" }))
        }
        "cancel" => {
            deployment
                .apply(|c| c.cancel().map(|events| ((), events)))
                .await?;
            Ok(json!({ "status": "idle" }))
        }
        "units" => Ok(json!(deployment.read(|c| c.views()).await)),
        "log" => Ok(json!(deployment.read(|c| c.log().to_vec()).await)),
        "diff" => {
            let index = required(request.index, "diff", "index")?;
            let unit = deployment
                .read(|c| c.unit(index).cloned())
                .await
                .ok_or(DaemonError::UnitNotFound { index })?;
            let diff = fleet_plan::unit_diff(&unit)?;
            let prev_digest = unit.prev.as_ref().map(content_digest).transpose()?;
            let next_digest = unit.next.as_ref().map(content_digest).transpose()?;
            Ok(json!({
                "index": index,
                "changed": unit.content_changed(),
                "prev_digest": prev_digest,
                "next_digest": next_digest,
                "diff": diff,
            }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    }
}

fn required<T>(value: Option<T>, cmd: &str, field: &str) -> Result<T, DaemonError> {
    value.ok_or_else(|| DaemonError::Protocol(format!("'{cmd}' requires '{field}'")))
}

async fn build_status_payload(daemon: &Daemon) -> Value {
    let snapshot = daemon.deployment.read(|c| c.snapshot()).await;
    let hosts: Vec<Value> = daemon
        .registry
        .connected()
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();

    json!({
        "running": true,
        "started_at": daemon.started_at.to_rfc3339(),
        "socket": socket_path(&daemon.home).display().to_string(),
        "agent_listen": daemon.config.agent_listen,
        "scripts_dir": daemon.scripts.dir().display().to_string(),
        "deployment": {
            "status": snapshot.status,
            "message": snapshot.message,
            "units": snapshot.units.len(),
            "log_lines": snapshot.log.len(),
        },
        "hosts": hosts,
        "log_streams": daemon.log_streams.len(),
        "subscribers": daemon.deployment.publisher().subscriber_count(),
    })
}

/// `subscribe`: snapshot first, then every event until the client leaves.
async fn stream_events(
    daemon: &Daemon,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (snapshot, mut events) = daemon.deployment.subscribe().await;
    write_response(&mut writer, &DaemonResponse::ok(json!(snapshot))).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => {
                if !matches!(line, Ok(Some(_))) {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => write_json_line(&mut writer, &event).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, resending snapshot");
                    let (snapshot, fresh) = daemon.deployment.subscribe().await;
                    events = fresh;
                    let resync = DeploymentEvent::Resync {
                        skipped,
                        snapshot: Box::new(snapshot),
                    };
                    write_json_line(&mut writer, &resync).await?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// `journal`: run `log.py` on a host and relay complete lines.
async fn stream_journal(
    daemon: &Daemon,
    request: &DaemonRequest,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let host = match required(request.target, "journal", "target") {
        Ok(host) => host,
        Err(err) => return write_response(&mut writer, &DaemonResponse::error(err.to_string())).await,
    };
    let started = start_log_job(daemon, host, request.unit.clone()).await;
    let (stream, mut log_lines) = match started {
        Ok(started) => started,
        Err(err) => return write_response(&mut writer, &DaemonResponse::error(err.to_string())).await,
    };
    write_response(&mut writer, &DaemonResponse::ok(json!({ "stream": stream }))).await?;

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            line = lines.next_line() => {
                if !matches!(line, Ok(Some(_))) {
                    break Ok(());
                }
            }
            batch = log_lines.recv() => match batch {
                Some(batch) => {
                    if let Err(err) = write_json_line(&mut writer, &json!({ "lines": batch })).await {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
        }
    };

    if let Some(job) = daemon.log_streams.remove(stream) {
        daemon.registry.kill(host, job);
    }
    result
}

async fn start_log_job(
    daemon: &Daemon,
    host: ObjectId,
    unit: Option<String>,
) -> Result<(u64, mpsc::UnboundedReceiver<Vec<String>>), DaemonError> {
    let content = daemon
        .scripts
        .log_script()
        .await?
        .ok_or_else(|| DaemonError::Protocol(format!("{LOG_SCRIPT} is missing")))?;

    let mut args = vec!["journal".to_string()];
    args.extend(unit);
    let script = ScriptRequest {
        name: LOG_SCRIPT.to_string(),
        interpreter: daemon.config.interpreter.clone(),
        content,
        args,
        stdin_type: StdinType::None,
        input_json: None,
        stdout_type: OutputType::Text,
        stderr_type: OutputType::None,
    };

    let stream = daemon.next_stream.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    let job = LogJob::new(stream, daemon.log_streams.clone(), tx);
    let id = daemon.registry.run_script(host, script, Box::new(job))?;
    daemon.log_streams.register(stream, id);
    tracing::info!(host = %host, stream, job = %id, "log stream started");
    Ok((stream, rx))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_json_line<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    write_json_line(writer, response).await
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
