// src/transport/stdio.rs

//! Standard-stream transport: one request line on stdin, results on stdout.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::line_reader::{ReaderScope, StreamSource};
use super::process::{self, ProcessSupervisor};
use super::{BoxFuture, Communicator, CommunicatorEvent, LaunchSpec, TransportSettings};
use crate::errors::{IpcError, Result};
use crate::types::IpcMode;

/// Runs the child with all three standard streams piped.
///
/// The protocol is single-shot: [`Communicator::send`] writes one line and
/// closes stdin, after which the child is expected to answer on stdout and
/// exit. Blank stdout/stderr lines are dropped.
pub struct StdioCommunicator {
    settings: TransportSettings,
    events: mpsc::Sender<CommunicatorEvent>,
    active: AtomicBool,
    session: Mutex<Option<Session>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

struct Session {
    scope: ReaderScope,
    supervisor: ProcessSupervisor,
}

impl StdioCommunicator {
    pub fn new(settings: TransportSettings, events: mpsc::Sender<CommunicatorEvent>) -> Self {
        Self {
            settings,
            events,
            active: AtomicBool::new(false),
            session: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    /// OS process id of the current child, if one was started.
    pub fn pid(&self) -> Option<u32> {
        self.lock_session()
            .as_ref()
            .and_then(|s| s.supervisor.pid())
    }

    /// Whether a child was started and has not been reaped yet.
    pub fn is_alive(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| !s.supervisor.has_exited())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn start_inner(&self, launch: &LaunchSpec, cancel: CancellationToken) -> Result<()> {
        super::ensure_mode(IpcMode::StandardStream, launch)?;
        if cancel.is_cancelled() {
            return Err(IpcError::Canceled);
        }

        // A communicator only ever drives one child at a time.
        self.stop_inner().await;

        let mut cmd = process::command(&launch.interpreter, &launch.args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Claimed before spawning; a stop that lands before the session is
        // published is picked up below.
        self.active.store(true, Ordering::SeqCst);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(IpcError::ProcessStart {
                    program: launch.interpreter.clone(),
                    source,
                });
            }
        };

        info!(
            pid = ?child.id(),
            interpreter = %launch.interpreter.display(),
            args = ?launch.args,
            "started child process (standard-stream)"
        );

        let scope = ReaderScope::with_max_line(self.settings.max_line_bytes);
        if let Some(stdout) = child.stdout.take() {
            scope.spawn_reader(stdout, StreamSource::Stdout, true, self.events.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            scope.spawn_reader(stderr, StreamSource::Stderr, true, self.events.clone());
        }
        scope.seal();

        let stdin = child.stdin.take();
        let supervisor = ProcessSupervisor::spawn(
            child,
            scope.clone(),
            self.events.clone(),
            self.settings.drain_timeout,
        );
        let mut exit_rx = supervisor.exit_watch();
        let readers = scope.clone();

        *self.stdin.lock().await = stdin;
        *self.lock_session() = Some(Session { scope, supervisor });

        if !self.active.load(Ordering::SeqCst) {
            debug!("stopped while starting; tearing down the new child");
            let orphan = self.lock_session().take();
            self.stdin.lock().await.take();
            if let Some(session) = orphan {
                self.teardown(session).await;
            }
            return Err(IpcError::NotRunning);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Canceled),
            exit_code = process::wait_exited(&mut exit_rx) => {
                Err(IpcError::ExitedDuringStartup { exit_code })
            }
            _ = tokio::time::sleep(self.settings.startup_grace) => Ok(()),
        };

        if let Err(e) = &outcome {
            debug!(error = %e, "standard-stream start failed; tearing down");
            if matches!(e, IpcError::ExitedDuringStartup { .. }) {
                // Keep whatever the child printed before dying.
                let _ = tokio::time::timeout(self.settings.drain_timeout, readers.drained()).await;
            }
            self.stop_inner().await;
        }
        outcome
    }

    async fn send_inner(&self, message: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(IpcError::Canceled);
        }
        if !self.is_alive() {
            return Err(IpcError::NotRunning);
        }

        let mut stdin = self
            .stdin
            .lock()
            .await
            .take()
            .ok_or(IpcError::InputClosed)?;

        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Canceled),
            res = write => res.map_err(IpcError::communication("writing request to child stdin")),
        }?;

        // Closing stdin is the end-of-request marker.
        drop(stdin);
        debug!(bytes = line.len(), "request written; stdin closed");
        Ok(())
    }

    async fn stop_inner(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let session = self.lock_session().take();
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, Session { scope, supervisor }: Session) {
        let pid = supervisor.pid();

        scope.cancel();
        supervisor
            .shutdown(None, self.settings.kill_timeout)
            .await;
        info!(?pid, "standard-stream communicator stopped");
    }
}

impl Communicator for StdioCommunicator {
    fn mode(&self) -> IpcMode {
        IpcMode::StandardStream
    }

    fn start<'a>(
        &'a self,
        launch: &'a LaunchSpec,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.start_inner(launch, cancel))
    }

    fn send<'a>(&'a self, message: &'a str, cancel: CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_inner(message, cancel))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }
}

impl Drop for StdioCommunicator {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Session { scope, supervisor }) = session {
            // The supervisor task outlives its handle; tell it to kill.
            scope.cancel();
            supervisor.kill_now();
        }
    }
}
