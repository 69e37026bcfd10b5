// src/transport/process_tree.rs

//! Forced termination of a child together with its descendants.
//!
//! # Platform Behavior
//! - **Unix**: children are spawned as leaders of their own process group
//!   (see [`super::process::command`]), so the whole tree is killed with a
//!   single `killpg(pgid, SIGKILL)`.
//! - **Windows**: `taskkill /PID {pid} /T /F` walks and kills the tree.

use std::io;

use tracing::debug;

/// Kill the process group / tree rooted at `pid`.
///
/// Returns `Ok(false)` when there was nothing left to kill.
pub async fn kill_tree(pid: u32) -> io::Result<bool> {
    #[cfg(unix)]
    {
        kill_tree_unix(pid)
    }

    #[cfg(windows)]
    {
        kill_tree_windows(pid).await
    }

    #[cfg(not(any(unix, windows)))]
    {
        debug!(pid, "process tree termination not supported on this platform");
        Ok(false)
    }
}

#[cfg(unix)]
fn kill_tree_unix(pid: u32) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    debug!(pgid, "sending SIGKILL to process group");
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!(pgid, "process group already gone");
            Ok(false)
        }
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
async fn kill_tree_windows(pid: u32) -> io::Result<bool> {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    debug!(pid, "terminating process tree with taskkill");
    let output = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .await?;

    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    // "not found" just means the tree already exited.
    if stderr.contains("not found") || stderr.contains("not running") {
        Ok(false)
    } else {
        Err(io::Error::other(format!("taskkill failed: {}", stderr.trim())))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use super::*;
    use crate::transport::process::command;

    #[tokio::test]
    async fn kills_a_running_group_leader() {
        let mut cmd = command(std::path::Path::new("sleep"), &["30".to_string()]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().expect("spawn sleep");
        let pid = child.id().expect("running child has a pid");

        assert!(kill_tree(pid).await.unwrap());

        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("child should die after SIGKILL")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn missing_group_is_not_an_error() {
        let mut cmd = command(std::path::Path::new("true"), &[]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().expect("spawn true");
        let pid = child.id().expect("pid");
        child.wait().await.unwrap();

        assert!(!kill_tree(pid).await.unwrap());
    }
}
