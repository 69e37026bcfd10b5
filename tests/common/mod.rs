#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

pub use ipcrun_test_utils::{init_tracing, with_timeout};

use ipcrun::transport::{CommunicatorEvent, ExitSignal, TransportSettings};
use tokio::sync::mpsc;

/// Path of the reference child built alongside the tests.
pub fn echo_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ipcrun-echo"))
}

/// Transport timings tightened for tests.
pub fn fast_settings() -> TransportSettings {
    TransportSettings {
        startup_grace: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_millis(500),
        kill_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_millis(500),
        max_line_bytes: 1024 * 1024,
    }
}

/// Collect events up to and including the exit notification.
pub async fn events_until_exit(
    rx: &mut mpsc::Receiver<CommunicatorEvent>,
) -> (Vec<CommunicatorEvent>, Option<ExitSignal>) {
    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        if let CommunicatorEvent::Exited(signal) = event {
            return (seen, Some(signal));
        }
        seen.push(event);
    }
    (seen, None)
}

pub fn outputs(events: &[CommunicatorEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            CommunicatorEvent::Output(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[CommunicatorEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            CommunicatorEvent::Error(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

/// Whether a process with this pid still exists (zombies count as gone once
/// reaped by their parent).
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll until `pid` is gone or the deadline passes.
#[cfg(unix)]
pub async fn wait_for_exit(pid: u32, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_exists(pid)
}
