//! Jobs: outstanding remote script runs and the handlers that consume their
//! output.
//!
//! A job is created when a `run_script` command goes out on a
//! [`crate::connection::HostConnection`] and lives until the agent reports a
//! terminal message, the job is killed, or the connection closes. The
//! connection routes inbound messages to the job's [`JobHandler`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Process-wide unique job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The script ran to completion; it succeeded only if `exit_code` is 0.
    Success { exit_code: i32 },
    /// The agent could not run the script.
    Failure,
    /// The connection closed before a terminal message arrived.
    TransportLost,
}

impl JobOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, JobOutcome::Success { exit_code: 0 })
    }

    /// Deployment log line for a failed outcome.
    pub fn failure_line(self) -> Option<String> {
        match self {
            JobOutcome::Success { exit_code: 0 } => None,
            JobOutcome::Success { exit_code } => Some(format!("Failed with exit code {exit_code}")),
            JobOutcome::Failure => Some("Failed".to_string()),
            JobOutcome::TransportLost => Some("Failed: connection lost".to_string()),
        }
    }
}

/// Consumer of one job's inbound messages.
///
/// Called from the connection's reader; implementations must not block.
pub trait JobHandler: Send {
    /// A decoded chunk of script output.
    fn on_data(&mut self, source: OutputSource, chunk: &[u8]);

    /// The job ended. Called at most once; the handler is dropped afterwards.
    fn on_terminal(&mut self, outcome: JobOutcome);

    /// The job was cancelled locally before a terminal message arrived.
    fn on_kill(&mut self) {}
}

// ---------------------------------------------------------------------------
// Chunk decoding
// ---------------------------------------------------------------------------

/// Decodes a byte stream chunk by chunk. A multi-byte character split
/// across chunks is held back until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Whatever is still held back, decoded lossily.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

// ---------------------------------------------------------------------------
// DeployJob
// ---------------------------------------------------------------------------

/// Applies one deployment unit: forwards all output to the deployment log
/// and reports the outcome on a oneshot.
pub struct DeployJob {
    log: mpsc::UnboundedSender<String>,
    done: Option<oneshot::Sender<JobOutcome>>,
    decoders: HashMap<OutputSource, Utf8Carry>,
}

impl DeployJob {
    pub fn new(log: mpsc::UnboundedSender<String>) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                log,
                done: Some(tx),
                decoders: HashMap::new(),
            },
            rx,
        )
    }
}

impl JobHandler for DeployJob {
    fn on_data(&mut self, source: OutputSource, chunk: &[u8]) {
        let text = self.decoders.entry(source).or_default().push(chunk);
        if !text.is_empty() {
            let _ = self.log.send(text);
        }
    }

    fn on_terminal(&mut self, outcome: JobOutcome) {
        if let Some(done) = self.done.take() {
            for decoder in self.decoders.values_mut() {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    let _ = self.log.send(tail);
                }
            }
            let _ = done.send(outcome);
        }
    }

    fn on_kill(&mut self) {
        self.on_terminal(JobOutcome::Failure);
    }
}

// ---------------------------------------------------------------------------
// LogJob
// ---------------------------------------------------------------------------

/// Requester-side table of live log streams: stream id -> job.
#[derive(Debug, Clone, Default)]
pub struct LogStreams {
    inner: Arc<Mutex<HashMap<u64, JobId>>>,
}

impl LogStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JobId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, stream: u64, job: JobId) {
        self.map().insert(stream, job);
    }

    pub fn remove(&self, stream: u64) -> Option<JobId> {
        self.map().remove(&stream)
    }

    pub fn job(&self, stream: u64) -> Option<JobId> {
        self.map().get(&stream).copied()
    }

    /// Remove and return every registered job.
    pub fn drain(&self) -> Vec<JobId> {
        self.map().drain().map(|(_, job)| job).collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streams a host log to a requester, complete stdout lines only.
pub struct LogJob {
    stream: u64,
    streams: LogStreams,
    lines: mpsc::UnboundedSender<Vec<String>>,
    decoder: Utf8Carry,
    partial: String,
}

impl LogJob {
    pub fn new(stream: u64, streams: LogStreams, lines: mpsc::UnboundedSender<Vec<String>>) -> Self {
        Self {
            stream,
            streams,
            lines,
            decoder: Utf8Carry::default(),
            partial: String::new(),
        }
    }
}

impl JobHandler for LogJob {
    fn on_data(&mut self, source: OutputSource, chunk: &[u8]) {
        if source != OutputSource::Stdout {
            return;
        }
        let text = self.decoder.push(chunk);
        self.partial.push_str(&text);
        let Some(last_newline) = self.partial.rfind('\n') else {
            return;
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        let complete = complete.strip_suffix('\n').unwrap_or(&complete);
        let lines: Vec<String> = complete
            .split('\n')
            .map(str::to_string)
            .collect();
        let _ = self.lines.send(lines);
    }

    fn on_terminal(&mut self, _outcome: JobOutcome) {
        self.streams.remove(self.stream);
    }

    fn on_kill(&mut self) {
        self.streams.remove(self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn only_zero_exit_is_ok() {
        assert!(JobOutcome::Success { exit_code: 0 }.is_ok());
        assert!(!JobOutcome::Success { exit_code: 3 }.is_ok());
        assert!(!JobOutcome::Failure.is_ok());
        assert!(!JobOutcome::TransportLost.is_ok());
        assert_eq!(
            JobOutcome::Success { exit_code: 3 }.failure_line().as_deref(),
            Some("Failed with exit code 3")
        );
        assert_eq!(JobOutcome::Failure.failure_line().as_deref(), Some("Failed"));
    }

    #[tokio::test]
    async fn deploy_job_forwards_output_and_completes_once() {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let (mut job, done) = DeployJob::new(log_tx);
        job.on_data(OutputSource::Stdout, b"creating user\n");
        job.on_data(OutputSource::Stderr, b"warning: shell");
        job.on_terminal(JobOutcome::Success { exit_code: 0 });
        job.on_terminal(JobOutcome::Failure);

        assert_eq!(log_rx.recv().await.as_deref(), Some("creating user\n"));
        assert_eq!(log_rx.recv().await.as_deref(), Some("warning: shell"));
        assert_eq!(done.await.expect("outcome"), JobOutcome::Success { exit_code: 0 });
    }

    #[tokio::test]
    async fn deploy_job_joins_characters_split_across_chunks() {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let (mut job, done) = DeployJob::new(log_tx);
        let bytes = "café ✓\n".as_bytes();
        // Split inside "é" and again inside "✓".
        job.on_data(OutputSource::Stdout, &bytes[..4]);
        job.on_data(OutputSource::Stdout, &bytes[4..8]);
        job.on_data(OutputSource::Stdout, &bytes[8..]);
        job.on_data(OutputSource::Stderr, &[0xE2, 0x9C]);
        job.on_terminal(JobOutcome::Success { exit_code: 0 });

        let mut text = String::new();
        while let Ok(chunk) = log_rx.try_recv() {
            text.push_str(&chunk);
        }
        assert_eq!(text, "café ✓\n\u{FFFD}");
        assert_eq!(done.await.expect("outcome"), JobOutcome::Success { exit_code: 0 });
    }

    #[test]
    fn invalid_bytes_are_replaced_without_stalling() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(b"ok\xFFok"), "ok\u{FFFD}ok");
        assert_eq!(carry.push(&[0xC3]), "");
        assert_eq!(carry.push(&[0xA9]), "é");
        assert_eq!(carry.finish(), "");
    }

    #[tokio::test]
    async fn log_job_flushes_complete_lines_only() {
        let streams = LogStreams::new();
        let job_id = JobId::next();
        streams.register(7, job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut job = LogJob::new(7, streams.clone(), tx);

        job.on_data(OutputSource::Stdout, b"Oct 18 sshd[1]: acc");
        assert!(rx.try_recv().is_err(), "partial line must be held back");

        job.on_data(OutputSource::Stdout, b"epted\nOct 18 cron[2]: run\nOct 18 ker");
        assert_eq!(
            rx.recv().await.expect("lines"),
            vec!["Oct 18 sshd[1]: accepted".to_string(), "Oct 18 cron[2]: run".to_string()]
        );

        job.on_data(OutputSource::Stderr, b"ignored\n");
        job.on_data(OutputSource::Stdout, b"nel: ok\n");
        assert_eq!(rx.recv().await.expect("lines"), vec!["Oct 18 kernel: ok".to_string()]);

        assert_eq!(streams.job(7), Some(job_id));
        job.on_kill();
        assert!(streams.is_empty(), "kill deregisters from the requester");
    }
}
