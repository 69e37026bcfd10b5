// src/transport/mod.rs

//! Process communication layer.
//!
//! A [`Communicator`] owns one child interpreter process for the duration of
//! one run and exchanges newline-delimited messages with it.
//!
//! - [`line_reader`] turns a byte stream into a cancelable sequence of lines
//!   and owns the reader cancellation scope shared by both transports.
//! - [`process`] builds the child command and supervises the child in a
//!   background task that reaps it and emits the single [`ExitSignal`].
//! - [`process_tree`] kills the child together with its descendants.
//! - [`stdio`] talks to the child over its standard streams.
//! - [`socket`] talks to the child over a loopback TCP connection.
//! - [`selector`] provides the [`CommunicatorFactory`] trait and the
//!   [`TransportSelector`] used in production, which tests can replace.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::types::IpcMode;

pub mod line_reader;
pub mod process;
pub mod process_tree;
pub mod selector;
pub mod socket;
pub mod stdio;

pub use selector::{CommunicatorFactory, TransportSelector};
pub use socket::SocketCommunicator;
pub use stdio::StdioCommunicator;

/// Boxed future returned by [`Communicator`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Exit status of a child process, produced at most once per communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSignal {
    /// Raw exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

/// Events flowing out of a communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommunicatorEvent {
    /// A line from the child's stdout (or from the socket connection).
    Output(String),
    /// A line from the child's stderr, or a reader failure.
    Error(String),
    /// The child process terminated.
    Exited(ExitSignal),
}

/// What a transport needs to launch the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    /// Script path followed by any extra arguments.
    pub args: Vec<String>,
    pub mode: IpcMode,
}

/// Longest line a reader accepts before discarding it.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Timing and framing knobs shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// How long `start` waits after spawn before declaring the child alive.
    pub startup_grace: Duration,
    /// Socket mode: how long to wait for the child to connect back.
    pub connect_timeout: Duration,
    /// Socket mode: how long `stop` waits for a voluntary exit after closing
    /// the connection.
    pub stop_grace: Duration,
    /// Upper bound for the supervisor to finish after a kill request.
    pub kill_timeout: Duration,
    /// How long readers may keep draining output after the child exited.
    pub drain_timeout: Duration,
    /// Lines from the child longer than this are dropped and reported.
    pub max_line_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// One live conversation with a child process.
///
/// Every method takes `&self` so that `stop` can race with an in-flight
/// `start`/`send` (e.g. a shutdown handler and an exit notification on
/// different threads). Implementations guard teardown with an atomic flag so
/// that it runs exactly once per started process.
pub trait Communicator: Send + Sync {
    /// The transport kind this communicator implements.
    fn mode(&self) -> IpcMode;

    /// Launch the child and its background readers.
    ///
    /// Fails with a start-failure, `ConnectTimeout` or `Canceled` error; in
    /// every failure case nothing is left running when the future resolves.
    fn start<'a>(
        &'a self,
        launch: &'a LaunchSpec,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// Send one message, terminated by a newline.
    fn send<'a>(&'a self, message: &'a str, cancel: CancellationToken) -> BoxFuture<'a, Result<()>>;

    /// Tear everything down. Idempotent, never fails.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Reject a launch spec meant for the other transport.
pub(crate) fn ensure_mode(transport: IpcMode, launch: &LaunchSpec) -> Result<()> {
    if launch.mode != transport {
        return Err(crate::errors::IpcError::ModeMismatch {
            transport,
            requested: launch.mode,
        });
    }
    Ok(())
}
