//! Non-blocking subprocess execution with timeouts.
//!
//! Everything the agent runs on the host goes through here: arguments are passed as a vector
//! (never through a shell), child stdin comes from /dev/null, and the child's PATH is pinned to
//! the system directories.  Callers await a completion instead of blocking a request worker.

use crate::error::{self, Result};
use snafu::ResultExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Children don't inherit the agent's PATH; they get the system directories and nothing else.
pub const FORCED_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Timeout for primary commands (systemctl calls and script runners).
pub const COMMAND_TIMEOUT_SECS: u64 = 30;
/// Timeout for the short status captures used in post-action verification.
pub const STATUS_TIMEOUT_SECS: u64 = 10;

/// Chunk size for the merged-output reads; keeps a chatty child from ballooning memory between
/// scheduler polls.
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub rc: i32,
    pub out: String,
}

/// Run `argv` and wait up to `timeout_secs`, caring only about the exit code.  A clean exit
/// yields the status, termination by a signal yields 128+signal, a timeout kills the child and
/// yields -1.
pub async fn run_rc(timeout_secs: u64, argv: &[String]) -> Result<i32> {
    let (program, args) = split_argv(argv)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .context(error::SpawnFailedSnafu { command: program })?;

    let waited = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(wait) => {
            let status = wait.context(error::SpawnFailedSnafu { command: program })?;
            Ok(status_rc(status))
        }
        Err(_) => {
            warn!("'{}' timed out after {}s, killing it", program, timeout_secs);
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(-1)
        }
    }
}

/// Run `argv` and collect stdout and stderr merged into one buffer, interleaved as the child
/// produces them.  A timeout kills the child and yields `{rc: -1, out: "TIMEOUT after <sec>s"}`.
pub async fn capture(timeout_secs: u64, argv: &[String]) -> Result<Capture> {
    let (program, args) = split_argv(argv)?;

    let mut child = Command::new(program)
        .args(args)
        .env("PATH", FORCED_PATH)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(error::SpawnFailedSnafu { command: program })?;

    // The pipes are owned handles; taking them lets the read loop and the final wait coexist.
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let drain_and_wait = async {
        let mut out = Vec::new();
        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];
        let mut out_open = stdout.is_some();
        let mut err_open = stderr.is_some();

        while out_open || err_open {
            tokio::select! {
                read = stdout.as_mut().unwrap().read(&mut out_buf), if out_open => {
                    match read {
                        Ok(0) | Err(_) => out_open = false,
                        Ok(n) => out.extend_from_slice(&out_buf[..n]),
                    }
                }
                read = stderr.as_mut().unwrap().read(&mut err_buf), if err_open => {
                    match read {
                        Ok(0) | Err(_) => err_open = false,
                        Ok(n) => out.extend_from_slice(&err_buf[..n]),
                    }
                }
            }
        }

        child.wait().await.map(|status| (status, out))
    };

    let drained = tokio::time::timeout(Duration::from_secs(timeout_secs), drain_and_wait).await;
    match drained {
        Ok(finished) => {
            let (status, out) =
                finished.context(error::SpawnFailedSnafu { command: program })?;
            Ok(Capture {
                rc: status_rc(status),
                out: String::from_utf8_lossy(&out).into_owned(),
            })
        }
        Err(_) => {
            warn!("'{}' timed out after {}s, killing it", program, timeout_secs);
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(Capture {
                rc: -1,
                out: format!("TIMEOUT after {}s\n", timeout_secs),
            })
        }
    }
}

fn split_argv(argv: &[String]) -> Result<(&str, &[String])> {
    match argv.first().map(String::as_str).filter(|p| !p.is_empty()) {
        Some(program) => Ok((program, &argv[1..])),
        None => Err(error::Error::SpawnFailed {
            command: "<empty argv>".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        }),
    }
}

fn status_rc(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}
