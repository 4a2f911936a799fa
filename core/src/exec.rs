//! Approved-command execution.
//!
//! The executor owns the log file for its request: a banner header
//! identifying the command, then stdout and stderr interleaved in arrival
//! order. The same bytes go to an in-memory capture (bounded by
//! `max_capture_bytes`) and optionally to a caller-provided stream.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use slb_protocol::CommandSpec;
use slb_protocol::ExecutionResult;
use slb_protocol::Result;
use slb_protocol::SlbErr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::DEFAULT_EXECUTION_TIMEOUT;

/// Bytes of combined output kept in memory by default.
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 64 * 1024;

const LOG_BANNER: &str = "SLB Command Execution";

/// How long to wait for output pipes to drain after a kill. An orphaned
/// grandchild can keep the pipe open indefinitely; partial output is
/// returned once the grace period lapses.
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One chunk of child output, for callers that stream live.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub spec: CommandSpec,
    pub log_path: std::path::PathBuf,
    pub timeout: Duration,
    pub max_capture_bytes: usize,
    /// Live output sink; `None` for fire-and-collect callers.
    pub stream: Option<UnboundedSender<OutputChunk>>,
}

impl ExecParams {
    pub fn new(spec: CommandSpec, log_path: std::path::PathBuf) -> Self {
        Self {
            spec,
            log_path,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            stream: None,
        }
    }
}

#[derive(Debug)]
pub struct ExecOutcome {
    /// Combined output in arrival order, truncated at the capture cap.
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn to_execution_result(&self, log_path: std::path::PathBuf) -> ExecutionResult {
        ExecutionResult {
            exit_code: self.exit_code,
            duration_ms: self.duration.as_millis() as u64,
            timed_out: self.timed_out,
            log_path,
            output_excerpt: self.output.clone(),
        }
    }
}

/// Run the command to completion or until the timeout/cancel fires.
/// Cancellation kills the child best-effort; output captured so far is
/// still returned.
pub async fn run(params: ExecParams, cancel: Arc<Notify>) -> Result<ExecOutcome> {
    let started_at = Utc::now();
    let start = Instant::now();
    let command_line = build_command_line(&params.spec)?;

    let mut log = open_log(&params.log_path).await?;
    let header = format!(
        "{LOG_BANNER}\ncmd={}\ncwd={}\nshell={}\nstarted_at={}\n\n",
        params.spec.display_redacted,
        params.spec.cwd.display(),
        params.spec.shell,
        started_at.to_rfc3339(),
    );
    log.write_all(header.as_bytes())
        .await
        .map_err(|e| SlbErr::io("write execution log header", e))?;
    let log = Arc::new(tokio::sync::Mutex::new(log));

    let mut command = Command::new(&command_line[0]);
    command
        .args(&command_line[1..])
        .current_dir(&params.spec.cwd)
        // No stdin: commands that probe it for input would hang forever.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|e| {
        SlbErr::io(format!("spawn `{}`", params.spec.display_redacted), e)
    })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        SlbErr::Internal("stdout pipe was unexpectedly not available".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        SlbErr::Internal("stderr pipe was unexpectedly not available".to_string())
    })?;

    let capture = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let stdout_task = tokio::spawn(tee_stream(
        stdout,
        OutputStream::Stdout,
        Arc::clone(&log),
        Arc::clone(&capture),
        params.stream.clone(),
        params.max_capture_bytes,
    ));
    let stderr_task = tokio::spawn(tee_stream(
        stderr,
        OutputStream::Stderr,
        Arc::clone(&log),
        Arc::clone(&capture),
        params.stream.clone(),
        params.max_capture_bytes,
    ));

    let cancelled = cancel.notified();
    let (exit_code, timed_out) = tokio::select! {
        result = tokio::time::timeout(params.timeout, child.wait()) => match result {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(e)) => return Err(SlbErr::io("wait for command", e)),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (-1, true)
            }
        },
        _ = cancelled => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (-1, true)
        }
    };

    let duration = start.elapsed();
    let drain = async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    };
    if timed_out {
        let _ = tokio::time::timeout(STREAM_DRAIN_GRACE, drain).await;
    } else {
        drain.await;
    }
    {
        let mut log = log.lock().await;
        let _ = log.flush().await;
    }

    let captured = capture.lock().await.clone();
    let outcome = ExecOutcome {
        output: String::from_utf8_lossy(&captured).into_owned(),
        exit_code,
        duration,
        timed_out,
    };
    if outcome.timed_out {
        tracing::warn!(
            cmd = %params.spec.display_redacted,
            timeout_secs = params.timeout.as_secs(),
            "command killed on timeout"
        );
    }
    Ok(outcome)
}

fn build_command_line(spec: &CommandSpec) -> Result<Vec<String>> {
    if spec.shell {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Ok(vec![shell, "-c".to_string(), spec.raw.clone()])
    } else {
        if spec.argv.is_empty() {
            return Err(SlbErr::validation("command", "argv is empty"));
        }
        Ok(spec.argv.clone())
    }
}

async fn open_log(path: &std::path::Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SlbErr::io("create execution log directory", e))?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options
        .open(path)
        .await
        .map_err(|e| SlbErr::io("open execution log", e))
}

/// Forward a child stream into the log file, the bounded in-memory
/// capture, and the optional live sink. Reads to EOF even after the cap is
/// hit so the child never blocks on a full pipe.
async fn tee_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    log: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    capture: Arc<tokio::sync::Mutex<Vec<u8>>>,
    sink: Option<UnboundedSender<OutputChunk>>,
    max_capture_bytes: usize,
) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let chunk = &buf[..n];
        {
            let mut log = log.lock().await;
            let _ = log.write_all(chunk).await;
        }
        {
            let mut capture = capture.lock().await;
            let remaining = max_capture_bytes.saturating_sub(capture.len());
            if remaining > 0 {
                capture.extend_from_slice(&chunk[..n.min(remaining)]);
            }
        }
        if let Some(sink) = &sink {
            let _ = sink.send(OutputChunk {
                stream,
                data: chunk.to_vec(),
            });
        }
    }
}
