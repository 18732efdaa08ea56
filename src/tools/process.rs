//! Purpose: Spawn external programs for tools and make sure they die with the call.
//! Exports: `ProcessOutput`, `run_process`.
//! Role: Shared subprocess runner for `rg`, `sg`, and shell commands.
//! Invariants: Each child runs in its own process group; dropping the call future kills the
//! whole group, so timeouts leave no stragglers.
//! Invariants: A missing program is reported as `ErrorKind::NotFound`.
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug)]
pub struct ProcessOutput {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub async fn run_process<I, S>(program: &str, args: I, cwd: &Path) -> Result<ProcessOutput, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if !cwd.is_dir() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("working directory `{}` does not exist", cwd.display()))
            .with_path(cwd)
            .with_hint("Verify the path exists and is spelled correctly."));
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|err| spawn_error(program, err))?;
    let guard = ProcessGroupGuard::new(child.id());
    debug!(program, pid = ?child.id(), "spawned tool process");

    let output = child.wait_with_output().await.map_err(|err| {
        Error::from_io(err, format!("failed waiting for `{program}`"))
    })?;
    guard.disarm();

    Ok(ProcessOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn spawn_error(program: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        return Error::new(ErrorKind::NotFound)
            .with_message(format!("`{program}` executable not found"))
            .with_hint(format!("Install `{program}` or make sure it is on PATH."))
            .with_source(err);
    }
    Error::from_io(err, format!("failed to spawn `{program}`"))
}

/// Kills the child's process group on drop unless the child was reaped normally.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run_process("sh", ["-c", "echo out; echo err >&2; exit 3"], dir.path())
            .await
            .expect("run");
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run_process("/nonexistent/sgmcp-tool", ["x"], dir.path())
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().unwrap_or_default().contains("executable not found"));
    }

    #[tokio::test]
    async fn missing_cwd_is_not_found() {
        let err = run_process("sh", ["-c", "true"], Path::new("/nonexistent/sgmcp-cwd"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dropping_the_future_kills_the_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("survivor");
        let script = format!("sleep 2 && touch {}", marker.display());
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            run_process("sh", ["-c", script.as_str()], dir.path()),
        )
        .await;
        assert!(result.is_err(), "call should time out");
        assert!(started.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "grandchild must not outlive the call");
    }
}
