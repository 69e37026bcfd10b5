// src/transport/socket.rs

//! Loopback socket transport.
//!
//! The child is launched as `<interpreter> <args..> socket <port>` and must
//! connect to `127.0.0.1:<port>`. Messages in both directions are
//! newline-terminated UTF-8. The child's stderr is still piped so that early
//! failures are visible before the handshake completes.

use std::io;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::line_reader::{ReaderScope, StreamSource};
use super::process::{self, ProcessSupervisor};
use super::{BoxFuture, Communicator, CommunicatorEvent, LaunchSpec, TransportSettings};
use crate::errors::{IpcError, Result};
use crate::types::IpcMode;

/// Frames waiting for the writer task.
const OUTBOX_CAPACITY: usize = 16;

/// Talks to the child over one accepted loopback TCP connection.
///
/// Unlike [`super::StdioCommunicator`], `send` leaves the connection open so
/// that any number of messages can be exchanged until `stop`.
///
/// Writes go through a per-session writer task that always puts whole
/// frames on the wire. Canceling a `send` only abandons the wait: a frame
/// that was already being written is finished, one still queued is skipped.
pub struct SocketCommunicator {
    settings: TransportSettings,
    events: mpsc::Sender<CommunicatorEvent>,
    active: AtomicBool,
    session: Mutex<Option<Session>>,
}

struct Session {
    scope: ReaderScope,
    supervisor: ProcessSupervisor,
    listener: Option<TcpListener>,
    port: u16,
    outbox: Option<mpsc::Sender<Outgoing>>,
    writer: Option<JoinHandle<()>>,
}

struct Outgoing {
    line: String,
    done: oneshot::Sender<io::Result<()>>,
}

impl SocketCommunicator {
    pub fn new(settings: TransportSettings, events: mpsc::Sender<CommunicatorEvent>) -> Self {
        Self {
            settings,
            events,
            active: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_session()
            .as_ref()
            .and_then(|s| s.supervisor.pid())
    }

    /// Loopback port of the current listener.
    pub fn port(&self) -> Option<u16> {
        self.lock_session().as_ref().map(|s| s.port)
    }

    pub fn is_connected(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| s.outbox.is_some())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn start_inner(&self, launch: &LaunchSpec, cancel: CancellationToken) -> Result<()> {
        super::ensure_mode(IpcMode::LocalSocket, launch)?;
        if cancel.is_cancelled() {
            return Err(IpcError::Canceled);
        }

        self.stop_inner().await;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(IpcError::Listener)?;
        let port = listener.local_addr().map_err(IpcError::Listener)?.port();

        let mut args = launch.args.clone();
        args.push("socket".to_string());
        args.push(port.to_string());

        let mut cmd = process::command(&launch.interpreter, &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
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
            port,
            "started child process (local-socket); waiting for connection"
        );

        let scope = ReaderScope::with_max_line(self.settings.max_line_bytes);
        if let Some(stderr) = child.stderr.take() {
            scope.spawn_reader(stderr, StreamSource::Stderr, false, self.events.clone());
        }

        let supervisor = ProcessSupervisor::spawn(
            child,
            scope.clone(),
            self.events.clone(),
            self.settings.drain_timeout,
        );
        let mut exit_rx = supervisor.exit_watch();

        *self.lock_session() = Some(Session {
            scope: scope.clone(),
            supervisor,
            listener: None,
            port,
            outbox: None,
            writer: None,
        });

        if !self.active.load(Ordering::SeqCst) {
            debug!(port, "stopped while starting; tearing down the new child");
            let orphan = self.lock_session().take();
            if let Some(session) = orphan {
                self.teardown(session).await;
            }
            return Err(IpcError::NotRunning);
        }

        let timeout = self.settings.connect_timeout;
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Canceled),
            _ = scope.cancelled() => Err(IpcError::NotRunning),
            accepted = listener.accept() => {
                accepted.map_err(IpcError::communication("accepting child connection"))
            }
            exit_code = process::wait_exited(&mut exit_rx) => {
                Err(IpcError::ExitedDuringStartup { exit_code })
            }
            _ = tokio::time::sleep(timeout) => Err(IpcError::ConnectTimeout(timeout)),
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, port, "local-socket start failed; tearing down");
                if matches!(e, IpcError::ExitedDuringStartup { .. }) {
                    // Keep whatever the child printed before dying.
                    scope.seal();
                    let _ = tokio::time::timeout(self.settings.drain_timeout, scope.drained()).await;
                }
                drop(listener);
                self.stop_inner().await;
                return Err(e);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        scope.spawn_reader(read_half, StreamSource::Socket, false, self.events.clone());
        scope.seal();

        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        let writer = tokio::spawn(write_frames(write_half, queue, scope.clone()));

        let adopted = match self.lock_session().as_mut() {
            Some(s) => {
                s.listener = Some(listener);
                s.outbox = Some(outbox);
                s.writer = Some(writer);
                true
            }
            None => false,
        };
        if !adopted {
            // Stopped concurrently while accepting; the canceled scope ends
            // the writer.
            return Err(IpcError::NotRunning);
        }

        info!(%peer, port, "child connected");
        Ok(())
    }

    async fn send_inner(&self, message: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(IpcError::Canceled);
        }

        let outbox = self
            .lock_session()
            .as_ref()
            .and_then(|s| s.outbox.clone())
            .ok_or(IpcError::NotRunning)?;

        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        let bytes = line.len();

        let (done, written) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IpcError::Canceled),
            queued = outbox.send(Outgoing { line, done }) => {
                queued.map_err(|_| IpcError::NotRunning)?
            }
        }

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IpcError::Canceled),
            written = written => written,
        };

        match written {
            Ok(Ok(())) => {
                debug!(bytes, "message sent over socket");
                Ok(())
            }
            Ok(Err(e)) => Err(IpcError::communication("writing to child socket")(e)),
            // The writer went away with the session.
            Err(_) => Err(IpcError::NotRunning),
        }
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
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: Session) {
        let Session {
            scope,
            supervisor,
            listener,
            port,
            outbox,
            writer,
        } = session;
        let connected = outbox.is_some();

        // Connection first, so that a child blocked on recv sees EOF.
        drop(outbox);
        scope.cancel();
        if let Some(writer) = writer {
            if tokio::time::timeout(self.settings.kill_timeout, writer)
                .await
                .is_err()
            {
                warn!(port, "socket writer did not finish; abandoning it");
            }
        }
        drop(listener);

        let pid = supervisor.pid();
        let grace = connected.then_some(self.settings.stop_grace);
        supervisor.shutdown(grace, self.settings.kill_timeout).await;
        info!(?pid, port, "local-socket communicator stopped");
    }
}

/// Owns the write half for one session.
///
/// Ends when the scope is canceled or every sender is gone, and then shuts
/// the connection down for writing.
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outgoing>,
    scope: ReaderScope,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if frame.done.is_closed() {
            debug!("send abandoned before writing; skipping frame");
            continue;
        }

        let write = async {
            writer.write_all(frame.line.as_bytes()).await?;
            writer.flush().await
        };
        let res = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            res = write => res,
        };
        let _ = frame.done.send(res);
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "socket shutdown failed");
    }
}

impl Communicator for SocketCommunicator {
    fn mode(&self) -> IpcMode {
        IpcMode::LocalSocket
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

impl Drop for SocketCommunicator {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            warn!(port = session.port, "socket communicator dropped without stop");
            session.scope.cancel();
            session.supervisor.kill_now();
        }
    }
}
