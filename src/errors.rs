// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Transports surface every failure as a distinct [`IpcError`] variant so the
//! coordinator and the CLI can tell a cancellation apart from a real error.
//! [`ErrorKind`] collapses the variants into the categories callers act on.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::IpcMode;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("failed to start process '{}': {source}", .program.display())]
    ProcessStart {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited during startup{}", exit_suffix(.exit_code))]
    ExitedDuringStartup { exit_code: Option<i32> },

    #[error("failed to open loopback listener: {0}")]
    Listener(#[source] std::io::Error),

    #[error("child did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("process is not running")]
    NotRunning,

    #[error("process input has already been closed")]
    InputClosed,

    #[error("operation canceled")]
    Canceled,

    #[error("communication failure while {context}: {source}")]
    Communication {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{transport} transport cannot run in {requested} mode")]
    ModeMismatch {
        transport: IpcMode,
        requested: IpcMode,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse failure category, used to decide how a failure is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The OS refused the process, or it died before it was usable.
    StartFailure,
    /// Socket mode: the child never connected back.
    ConnectTimeout,
    /// No live process or connection to talk to.
    NotRunning,
    /// The caller's cancellation fired.
    Canceled,
    /// Any other I/O failure while talking to the child.
    Communication,
    /// The request or configuration itself is invalid.
    InvalidRequest,
}

impl IpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::ProcessStart { .. }
            | IpcError::ExitedDuringStartup { .. }
            | IpcError::Listener(_) => ErrorKind::StartFailure,
            IpcError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            IpcError::NotRunning | IpcError::InputClosed => ErrorKind::NotRunning,
            IpcError::Canceled => ErrorKind::Canceled,
            IpcError::Communication { .. } | IpcError::Io(_) | IpcError::Other(_) => {
                ErrorKind::Communication
            }
            IpcError::ModeMismatch { .. } | IpcError::Config(_) | IpcError::Toml(_) => {
                ErrorKind::InvalidRequest
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    /// Exit code of a child that died before startup completed, if known.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            IpcError::ExitedDuringStartup { exit_code } => *exit_code,
            _ => None,
        }
    }

    /// Build a `map_err` adapter that wraps an I/O error as a communication
    /// failure with a short description of what was being done.
    pub fn communication(context: &'static str) -> impl FnOnce(std::io::Error) -> IpcError {
        move |source| IpcError::Communication { context, source }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::StartFailure => "start failure",
            ErrorKind::ConnectTimeout => "connect timeout",
            ErrorKind::NotRunning => "not running",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Communication => "communication failure",
            ErrorKind::InvalidRequest => "invalid request",
        };
        f.write_str(s)
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, IpcError>;
