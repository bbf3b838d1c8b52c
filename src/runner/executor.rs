//! Crawl child process execution.
//!
//! Spawns the crawl command with piped output and races three futures:
//! shutdown cancellation, the wall-clock timeout, and child exit. Timeout and
//! shutdown both terminate the child with SIGTERM, a grace period, then
//! SIGKILL. Every path, spawn failure included, resolves to exactly one
//! [`ExecOutcome`].

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::script::ScriptCommand;

/// Environment variable forced into the child so the crawl pipeline always
/// runs with production settings, whatever the operator's shell says.
pub const CHILD_MODE_ENV: &str = "CRAWLSCHED_MODE";

/// How long to wait for the output readers after the child is gone. A
/// lingering grandchild can hold the pipe open past the crawl's own exit.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// ExecLimits / ExecOutcome
// ---------------------------------------------------------------------------

/// Limits applied to one crawl run.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    /// Wall-clock ceiling for the run.
    pub timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Capture cap per output stream.
    pub max_capture_bytes: usize,
}

/// Terminal state of one execution.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Child exited with status zero.
    Completed { stdout: String, stderr: String },
    /// Child exited nonzero, died on a signal, or could not be spawned.
    Failed { message: String },
    /// Wall-clock ceiling hit; the child was terminated.
    TimedOut { limit: Duration },
    /// Shutdown requested; the child was terminated.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run the crawl command to completion under the given limits.
pub async fn run(
    run_id: Uuid,
    command: &ScriptCommand,
    limits: ExecLimits,
    cancel: CancellationToken,
) -> ExecOutcome {
    info!(
        run_id = %run_id,
        command = %command,
        timeout_sec = limits.timeout.as_secs(),
        "launching crawl"
    );

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .env(CHILD_MODE_ENV, "production")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome::Failed {
                message: format!("failed to spawn crawl command `{command}`: {e}"),
            };
        }
    };

    let child_pid = child.id();
    debug!(run_id = %run_id, pid = child_pid, "crawl child spawned");

    // The readers must run alongside wait(), otherwise the child blocks as
    // soon as a pipe fills.
    let stdout_task = capture_stream(child.stdout.take(), limits.max_capture_bytes);
    let stderr_task = capture_stream(child.stderr.take(), limits.max_capture_bytes);

    let timeout = tokio::time::sleep(limits.timeout);
    tokio::pin!(timeout);

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!(run_id = %run_id, "shutdown requested, terminating crawl");
            terminate_child(&mut child, limits.grace).await;
            ExecOutcome::Cancelled
        }

        _ = &mut timeout => {
            warn!(
                run_id = %run_id,
                timeout_sec = limits.timeout.as_secs(),
                "crawl hit its wall-clock ceiling, terminating"
            );
            terminate_child(&mut child, limits.grace).await;
            ExecOutcome::TimedOut { limit: limits.timeout }
        }

        status = child.wait() => {
            match status {
                Ok(exit) => {
                    info!(run_id = %run_id, exit_code = exit.code(), "crawl child exited");
                    if exit.success() {
                        let stdout = collect(stdout_task).await;
                        let stderr = collect(stderr_task).await;
                        ExecOutcome::Completed { stdout, stderr }
                    } else {
                        let stderr = collect(stderr_task).await;
                        ExecOutcome::Failed {
                            message: exit_message(&exit, &stderr),
                        }
                    }
                }
                Err(e) => ExecOutcome::Failed {
                    message: format!("failed to wait for crawl child: {e}"),
                },
            }
        }
    }
}

/// Gracefully terminate the crawl child.
///
/// Sends SIGTERM first, waits up to the grace period, then sends SIGKILL if
/// the process is still running.
async fn terminate_child(child: &mut tokio::process::Child, grace: Duration) {
    // Try SIGTERM first (Unix only).
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "crawl child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for crawl child after SIGTERM");
        }
        Err(_) => {
            // Grace period expired; force kill.
            warn!("crawl child did not exit within the grace period, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL crawl child");
            }
        }
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes and draining the rest so
/// the child never stalls on a full pipe.
fn capture_stream<R>(stream: Option<R>, cap: usize) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = n.min(cap - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            text.push_str("\n[output truncated]");
        }
        text
    })
}

/// Await a capture task, abandoning it if the stream stays open past the
/// drain window.
async fn collect(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "output capture task failed");
            String::new()
        }
        Err(_) => {
            warn!("output stream still open after child exit, abandoning capture");
            String::new()
        }
    }
}

#[cfg(unix)]
fn exit_message(exit: &std::process::ExitStatus, stderr: &str) -> String {
    use std::os::unix::process::ExitStatusExt;
    let base = match (exit.code(), exit.signal()) {
        (Some(code), _) => format!("crawl script exited with code {code}"),
        (None, Some(sig)) => format!("crawl script terminated by signal {sig}"),
        (None, None) => "crawl script terminated without an exit code".to_string(),
    };
    with_stderr_tail(base, stderr)
}

#[cfg(not(unix))]
fn exit_message(exit: &std::process::ExitStatus, stderr: &str) -> String {
    let base = match exit.code() {
        Some(code) => format!("crawl script exited with code {code}"),
        None => "crawl script terminated without an exit code".to_string(),
    };
    with_stderr_tail(base, stderr)
}

/// Append the tail of captured stderr to a synthesized error message.
fn with_stderr_tail(mut message: String, stderr: &str) -> String {
    const TAIL_BYTES: usize = 400;
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return message;
    }
    let tail = if trimmed.len() <= TAIL_BYTES {
        trimmed.to_string()
    } else {
        let mut start = trimmed.len() - TAIL_BYTES;
        while !trimmed.is_char_boundary(start) {
            start += 1;
        }
        format!("... {}", &trimmed[start..])
    };
    message.push_str("; stderr: ");
    message.push_str(&tail);
    message
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
