//! Wire formats: the operator socket (newline-delimited JSON request and
//! response) and the host-agent link (newline-delimited JSON messages).

use std::io::{BufRead, BufReader, Lines, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleet_core::ObjectId;

use crate::error::{io_err, DaemonError};
use crate::job::{JobId, OutputSource};
use crate::paths::socket_path;

// ---------------------------------------------------------------------------
// Operator socket
// ---------------------------------------------------------------------------

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    /// Object id for `plan`, host id for `journal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Service unit filter for `journal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    home: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

fn read_response(
    lines: &mut Lines<BufReader<UnixStream>>,
    home: &Path,
) -> Result<DaemonResponse, DaemonError> {
    let line = lines
        .next()
        .ok_or_else(|| {
            DaemonError::Protocol("daemon closed connection before responding".to_string())
        })?
        .map_err(|e| io_err(socket_path(home), e))?;
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;
    let mut lines = BufReader::new(stream).lines();
    read_response(&mut lines, home)
}

/// Send a request and return its `data`, mapping `ok: false` to an error.
pub fn request(home: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, request)?)
}

/// `status`, retried briefly while a freshly started daemon binds its socket.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let status = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_shutdown(home: &Path) -> Result<(), DaemonError> {
    request(home, &DaemonRequest::new("shutdown")).map(|_| ())
}

/// Open a streaming request (`subscribe`, `journal`).
///
/// Returns the data of the first response line and an iterator over every
/// following line, parsed as JSON, until the daemon closes the stream.
pub fn open_stream(
    home: &Path,
    request: &DaemonRequest,
) -> Result<(Value, impl Iterator<Item = Result<Value, DaemonError>>), DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;
    let mut lines = BufReader::new(stream).lines();
    let first = response_into_data(read_response(&mut lines, home)?)?;

    let socket = socket_path(home);
    let rest = lines.map(move |line| {
        let line = line.map_err(|e| io_err(&socket, e))?;
        Ok(serde_json::from_str(line.trim_end())?)
    });
    Ok((first, rest))
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Host agent link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinType {
    None,
    GivenJson,
}

/// Encoding of a script output stream in `data` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Chunks are base64 encoded.
    Binary,
    /// Chunks are UTF-8 text.
    Text,
    /// Stream is discarded by the agent.
    None,
}

/// Everything needed to run one script on a host, minus the job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub name: String,
    pub interpreter: String,
    pub content: String,
    pub args: Vec<String>,
    pub stdin_type: StdinType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_json: Option<Value>,
    pub stdout_type: OutputType,
    pub stderr_type: OutputType,
}

/// Server -> agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    RunScript {
        id: JobId,
        #[serde(flatten)]
        script: ScriptRequest,
    },
    Kill {
        id: JobId,
    },
}

/// Agent -> server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First line on a new link; binds it to the host object of that name.
    Hello { host: String },
    Data {
        id: JobId,
        source: OutputSource,
        data: String,
    },
    Success { id: JobId, code: i32 },
    Failure { id: JobId },
}
