//! Process execution for deskbox-agent.
//!
//! Every desktop action is an X11 tool run against a display. Programs are
//! invoked directly with argument vectors, never through a shell.

use crate::error::DesktopError;
use std::ffi::OsStr;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// Maximum stderr kept in error messages (64 KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Interval between readiness checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    // Find a valid UTF-8 boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

fn command<I, S>(program: &str, args: I, display: &str) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).env("DISPLAY", display).stdin(Stdio::null());
    cmd
}

/// Run `program` on `display` to completion and return its stdout.
///
/// # Errors
/// [`DesktopError::Command`] on a non-zero exit, with stderr attached.
pub async fn run<I, S>(program: &str, args: I, display: &str) -> Result<String, DesktopError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = command(program, args, display)
        .output()
        .await
        .map_err(|source| DesktopError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = truncate_output(
        String::from_utf8_lossy(&output.stderr).into_owned(),
        MAX_OUTPUT_SIZE,
    );
    let status = output.status.code().unwrap_or(-1);
    trace!(program, status, stdout = %stdout, stderr = %stderr, "command output");

    if !output.status.success() {
        warn!(program, status, "command failed");
        return Err(DesktopError::Command {
            program: program.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        });
    }
    debug!(program, stdout_len = stdout.len(), "command completed");
    Ok(stdout)
}

/// Start a long-running `program` on `display`.
///
/// The child is killed when its handle is dropped.
pub fn spawn<I, S>(program: &str, args: I, display: &str) -> Result<Child, DesktopError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = command(program, args, display)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DesktopError::Spawn {
            program: program.to_string(),
            source,
        })?;
    debug!(program, pid = ?child.id(), "spawned background process");
    Ok(child)
}

/// Kill a background process and reap it.
pub async fn stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        // Already exited
        trace!(error = %e, "kill failed");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap child");
    }
}

/// Whether a background process is still running.
pub fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Poll `ready` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut ready: F) -> Result<(), DesktopError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if ready().await {
            debug!(what, elapsed_ms = start.elapsed().as_millis() as u64, "ready");
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(DesktopError::NotReady(what.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_echo() {
        let out = run("echo", ["hello"], ":99").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_sets_display() {
        let out = run("sh", ["-c", "echo $DISPLAY"], ":42").await.unwrap();
        assert_eq!(out.trim(), ":42");
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let err = run("sh", ["-c", "echo boom >&2; exit 3"], ":0").await.unwrap_err();
        match err {
            DesktopError::Command { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let err = run("deskbox-no-such-program", Vec::<&str>::new(), ":0")
            .await
            .unwrap_err();
        assert!(matches!(err, DesktopError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let mut child = spawn("sleep", ["30"], ":0").unwrap();
        assert!(is_running(&mut child));
        stop(&mut child).await;
        assert!(!is_running(&mut child));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until("never", Duration::from_millis(250), || async { false }).await;
        assert!(matches!(result, Err(DesktopError::NotReady(_))));
    }

    #[test]
    fn test_truncate_output() {
        let s = "é".repeat(10);
        let t = truncate_output(s, 5);
        assert!(t.starts_with("éé"));
        assert!(t.ends_with("[output truncated]"));
    }
}
