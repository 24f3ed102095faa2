//! Stop and terminate a backend child process (spec.md §4.4.4).
//!
//! Two variants: graceful (signal, wait, escalate on expiry) and immediate
//! (signal straight to kill). An optional `cmdStop` override replaces
//! signaling outright; on Windows one is injected by the loader when unset.

use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::command;

#[derive(Debug, Error)]
pub enum StopError {
    #[error("failed to signal process group {pid}: {source}")]
    Signal { pid: u32, source: std::io::Error },
    #[error("cmdStop override failed: {0}")]
    CmdStop(std::io::Error),
    #[error("cmdStop override exited with status {0}")]
    CmdStopFailed(std::process::ExitStatus),
}

/// Send SIGTERM to the child's process group (POSIX) or run `taskkill`
/// (Windows). Does not wait for exit; the caller races this against a
/// graceful-stop deadline and reaps the child separately.
#[cfg(unix)]
pub fn signal_graceful(pid: u32) -> Result<(), StopError> {
    send_signal(pid, libc::SIGTERM)
}

/// SIGKILL the child's process group directly (POSIX immediate stop, or
/// POSIX escalation after a graceful deadline expires).
#[cfg(unix)]
pub fn signal_kill(pid: u32) -> Result<(), StopError> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), StopError> {
    // The child was spawned as its own process group leader, so pgid == pid.
    let ret = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(StopError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

/// Windows has no signal-based equivalent; both the graceful path and its
/// escalation use the same forceful `taskkill /F /T`.
#[cfg(windows)]
pub async fn signal_graceful(pid: u32) -> Result<(), StopError> {
    taskkill(pid).await
}

#[cfg(windows)]
pub async fn signal_kill(pid: u32) -> Result<(), StopError> {
    taskkill(pid).await
}

#[cfg(windows)]
async fn taskkill(pid: u32) -> Result<(), StopError> {
    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status()
        .await
        .map_err(|e| StopError::Signal { pid, source: e })?;
    if status.success() {
        Ok(())
    } else {
        Err(StopError::CmdStopFailed(status))
    }
}

/// Run a configured `cmdStop` override instead of signaling, substituting
/// `${PID}`.
pub async fn run_cmd_stop(cmd_stop: &str, pid: u32) -> Result<(), StopError> {
    let substituted = command::substitute_pid(cmd_stop, pid);
    let argv = command::tokenize(&substituted)
        .map_err(|e| StopError::CmdStop(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .await
        .map_err(StopError::CmdStop)?;

    if status.success() {
        Ok(())
    } else {
        Err(StopError::CmdStopFailed(status))
    }
}

/// The loader-injected default `cmdStop` for Windows when the model
/// declares none (spec.md §4.4.4).
#[cfg(windows)]
pub fn default_windows_cmd_stop() -> &'static str {
    "taskkill /f /t /pid ${PID}"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cmd_stop_with_missing_binary_errors() {
        let err = run_cmd_stop("definitely-not-a-real-binary-xyz ${PID}", 123)
            .await
            .unwrap_err();
        assert!(matches!(err, StopError::CmdStop(_)));
    }

    #[tokio::test]
    async fn cmd_stop_substitutes_pid_before_tokenizing() {
        // `echo` always exists in CI sandboxes and always exits 0.
        let result = run_cmd_stop("echo ${PID}", 999).await;
        assert!(result.is_ok());
    }
}
