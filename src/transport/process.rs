// src/transport/process.rs

//! Child process construction and supervision.

use std::path::Path;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::line_reader::ReaderScope;
use super::process_tree;
use super::{CommunicatorEvent, ExitSignal};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Build the command for an interpreter child.
///
/// On Unix the child leads a new process group so that the whole tree can be
/// signalled at once. On Windows no console window is created. In both cases
/// the child is killed if its handle is dropped.
pub fn command(program: &Path, args: &[String]) -> Command {
    let mut std_cmd = std::process::Command::new(program);
    std_cmd.args(args);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        std_cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd
}

/// Owns the background task that waits for a child to terminate.
///
/// The task reaps the child, publishes its exit code on a watch channel,
/// lets the readers drain for a bounded time and then emits exactly one
/// [`CommunicatorEvent::Exited`].
#[derive(Debug)]
pub struct ProcessSupervisor {
    pid: Option<u32>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
    task: JoinHandle<()>,
}

impl ProcessSupervisor {
    pub fn spawn(
        child: Child,
        scope: ReaderScope,
        events: mpsc::Sender<CommunicatorEvent>,
        drain_timeout: Duration,
    ) -> Self {
        let pid = child.id();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let task = tokio::spawn(supervise(
            child,
            pid,
            kill.clone(),
            exit_tx,
            scope,
            events,
            drain_timeout,
        ));

        Self {
            pid,
            kill,
            exit_rx,
            task,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Ask the supervisor to kill the child without waiting for it.
    pub fn kill_now(&self) {
        self.kill.cancel();
    }

    /// Receiver that observes the exit code once the child is reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Terminate the child and wait for the supervisor task.
    ///
    /// With `grace`, the child first gets that long to exit on its own. The
    /// kill covers the whole process tree. If the supervisor does not finish
    /// within `kill_timeout` it is aborted, which drops the child handle and
    /// triggers `kill_on_drop`.
    pub async fn shutdown(self, grace: Option<Duration>, kill_timeout: Duration) {
        let Self {
            pid,
            kill,
            mut exit_rx,
            mut task,
        } = self;

        if let Some(grace) = grace {
            let exited = exit_rx.borrow().is_some();
            if !exited
                && tokio::time::timeout(grace, wait_exited(&mut exit_rx))
                    .await
                    .is_err()
            {
                debug!(?pid, ?grace, "child did not exit within grace period");
            }
        }

        kill.cancel();

        match tokio::time::timeout(kill_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(?pid, error = %e, "process supervisor task failed"),
            Err(_) => {
                warn!(?pid, "process supervisor did not finish in time; aborting it");
                task.abort();
            }
        }
    }
}

/// Wait until the exit code is published.
///
/// Returns `None` if the supervisor went away without publishing one.
pub async fn wait_exited(rx: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    loop {
        let code = *rx.borrow_and_update();
        if code.is_some() {
            return code;
        }
        if rx.changed().await.is_err() {
            let code = *rx.borrow();
            return code;
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<i32>>,
    scope: ReaderScope,
    events: mpsc::Sender<CommunicatorEvent>,
    drain_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            debug!(?pid, "kill requested; terminating process tree");
            if let Some(pid) = pid {
                match process_tree::kill_tree(pid).await {
                    Ok(true) => {}
                    Ok(false) => debug!(pid, "process tree already gone"),
                    Err(e) => warn!(pid, error = %e, "failed to kill process tree"),
                }
            }
            if let Err(e) = child.start_kill() {
                debug!(?pid, error = %e, "direct kill failed");
            }
            child.wait().await
        }
    };

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(?pid, error = %e, "failed to wait for child process");
            -1
        }
    };
    info!(?pid, exit_code, "child process exited");
    exit_tx.send_replace(Some(exit_code));

    if tokio::time::timeout(drain_timeout, scope.drained())
        .await
        .is_err()
    {
        debug!(?pid, "readers still busy after exit; canceling them");
        scope.cancel();
    }

    // A stopped communicator has nobody left to read the channel.
    tokio::select! {
        biased;
        sent = events.send(CommunicatorEvent::Exited(ExitSignal { exit_code })) => {
            if sent.is_err() {
                debug!(?pid, "event receiver dropped before exit notification");
            }
        }
        _ = scope.cancelled() => {
            debug!(?pid, "communicator stopped; dropping exit notification");
        }
    }
}
