use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipcrun::errors::{IpcError, Result};
use ipcrun::transport::{
    BoxFuture, Communicator, CommunicatorEvent, CommunicatorFactory, ExitSignal, LaunchSpec,
};
use ipcrun::types::IpcMode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a fake `start` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStart {
    Succeed,
    /// Fail as if the child died during the grace window.
    ExitDuringStartup(i32),
    /// Fail with a connect timeout.
    Timeout,
    /// Block until the caller cancels.
    Hang,
}

/// Scripted behaviour shared by every communicator a [`FakeFactory`] makes.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub start: FakeStart,
    /// Lines emitted as `Output` after each successful send.
    pub replies: Vec<String>,
    /// Lines emitted as `Error` after each successful send.
    pub errors: Vec<String>,
    /// Emit `Exited` with this code after the replies.
    pub exit_after_send: Option<i32>,
    /// Delay before a send completes (lets tests cancel mid-write).
    pub send_delay: Duration,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            start: FakeStart::Succeed,
            replies: Vec::new(),
            errors: Vec::new(),
            exit_after_send: None,
            send_delay: Duration::ZERO,
        }
    }
}

/// Counters observed by tests.
#[derive(Debug, Default)]
pub struct FakeStats {
    pub created: AtomicUsize,
    pub starts: AtomicUsize,
    pub stop_calls: AtomicUsize,
    /// Stops that actually tore something down.
    pub teardowns: AtomicUsize,
    pub sent: Mutex<Vec<String>>,
    pub modes: Mutex<Vec<IpcMode>>,
}

impl FakeStats {
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

/// A communicator that never spawns anything.
pub struct FakeCommunicator {
    mode: IpcMode,
    script: FakeScript,
    events: mpsc::Sender<CommunicatorEvent>,
    stats: Arc<FakeStats>,
    active: AtomicBool,
}

impl FakeCommunicator {
    async fn start_inner(&self, cancel: CancellationToken) -> Result<()> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(IpcError::Canceled);
        }
        self.active.store(true, Ordering::SeqCst);

        let outcome = match self.script.start {
            FakeStart::Succeed => Ok(()),
            FakeStart::ExitDuringStartup(code) => {
                let _ = self
                    .events
                    .send(CommunicatorEvent::Exited(ExitSignal { exit_code: code }))
                    .await;
                Err(IpcError::ExitedDuringStartup {
                    exit_code: Some(code),
                })
            }
            FakeStart::Timeout => Err(IpcError::ConnectTimeout(Duration::from_millis(10))),
            FakeStart::Hang => {
                cancel.cancelled().await;
                Err(IpcError::Canceled)
            }
        };

        if outcome.is_err() {
            self.stop_inner();
        }
        outcome
    }

    async fn send_inner(&self, message: &str, cancel: CancellationToken) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(IpcError::NotRunning);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IpcError::Canceled),
            _ = tokio::time::sleep(self.script.send_delay) => {}
        }
        self.stats.sent.lock().unwrap().push(message.to_string());

        for line in &self.script.replies {
            let _ = self.events.send(CommunicatorEvent::Output(line.clone())).await;
        }
        for line in &self.script.errors {
            let _ = self.events.send(CommunicatorEvent::Error(line.clone())).await;
        }
        if let Some(code) = self.script.exit_after_send {
            let _ = self
                .events
                .send(CommunicatorEvent::Exited(ExitSignal { exit_code: code }))
                .await;
        }
        Ok(())
    }

    fn stop_inner(&self) {
        self.stats.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stats.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Communicator for FakeCommunicator {
    fn mode(&self) -> IpcMode {
        self.mode
    }

    fn start<'a>(
        &'a self,
        _launch: &'a LaunchSpec,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.start_inner(cancel))
    }

    fn send<'a>(&'a self, message: &'a str, cancel: CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_inner(message, cancel))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        self.stop_inner();
        Box::pin(async {})
    }
}

/// Factory handing out [`FakeCommunicator`]s that follow one script.
pub struct FakeFactory {
    script: FakeScript,
    stats: Arc<FakeStats>,
}

impl FakeFactory {
    pub fn new(script: FakeScript) -> (Self, Arc<FakeStats>) {
        let stats = Arc::new(FakeStats::default());
        (
            Self {
                script,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }
}

impl CommunicatorFactory for FakeFactory {
    fn create(
        &self,
        mode: IpcMode,
        events: mpsc::Sender<CommunicatorEvent>,
    ) -> Arc<dyn Communicator> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        self.stats.modes.lock().unwrap().push(mode);
        Arc::new(FakeCommunicator {
            mode,
            script: self.script.clone(),
            events,
            stats: Arc::clone(&self.stats),
            active: AtomicBool::new(false),
        })
    }
}
