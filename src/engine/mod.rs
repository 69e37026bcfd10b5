// src/engine/mod.rs

//! Lifecycle coordination for ipcrun.
//!
//! The coordinator is the only component callers talk to. It owns at most one
//! active [`Communicator`](crate::transport::Communicator), relays its events
//! tagged with a [`RunId`], and guarantees teardown on exit, failure,
//! cancellation or explicit stop.
//!
//! The pure state machine lives in [`core`]; the async shell that drives
//! transports and tasks is implemented in [`coordinator`].

use std::fmt;

use crate::errors::ErrorKind;
use crate::transport::ExitSignal;

pub mod coordinator;
pub mod core;

pub use coordinator::Coordinator;
pub use core::{CoreStep, LifecycleCore};

/// Identifier of one run, unique per coordinator and increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coordinator state machine: Idle → Starting → Running → Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    Running,
}

/// How a run ended. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child terminated after the run was established.
    Exited(ExitSignal),
    /// `start` or `send` failed.
    Failed { kind: ErrorKind, message: String },
    /// The run's cancellation was requested.
    Canceled,
    /// `stop` was called, or a new run replaced this one.
    Stopped,
}

/// Events delivered to whoever drives the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    StateChanged(LifecycleState),
    Output { run: RunId, line: String },
    Error { run: RunId, line: String },
    Finished { run: RunId, outcome: RunOutcome },
}
