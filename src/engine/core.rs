// src/engine/core.rs

//! Pure lifecycle state machine.
//!
//! [`LifecycleCore`] decides, for each command or communicator event, which
//! [`RunEvent`]s the caller should see and whether the active communicator
//! must be torn down. It has no channels, no Tokio types and performs no IO,
//! so every transition can be unit tested directly.
//!
//! The async shell ([`super::Coordinator`]) applies the returned
//! [`CoreStep`]s while holding its state lock.

use crate::engine::{LifecycleState, RunEvent, RunId, RunOutcome};
use crate::transport::{CommunicatorEvent, ExitSignal};

/// Decision returned by the core after a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStep {
    /// Events to deliver to the caller, in order.
    pub events: Vec<RunEvent>,
    /// Whether the shell should stop the run's communicator.
    pub teardown: bool,
}

impl CoreStep {
    fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && !self.teardown
    }
}

#[derive(Debug, Default)]
pub struct LifecycleCore {
    state: LifecycleState,
    current: Option<RunId>,
    next_id: u64,
    /// Exit observed while still Starting; applied by `mark_running`.
    early_exit: Option<ExitSignal>,
}

impl LifecycleCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The run that is Starting or Running, if any.
    pub fn current(&self) -> Option<RunId> {
        self.current
    }

    pub fn is_current(&self, id: RunId) -> bool {
        self.current == Some(id)
    }

    /// Idle → Starting. Fails with the active run id when not Idle.
    pub fn begin_run(&mut self) -> Result<(RunId, CoreStep), RunId> {
        if let Some(active) = self.current {
            return Err(active);
        }

        self.next_id += 1;
        let id = RunId(self.next_id);
        self.current = Some(id);
        self.state = LifecycleState::Starting;
        self.early_exit = None;

        Ok((
            id,
            CoreStep {
                events: vec![RunEvent::StateChanged(LifecycleState::Starting)],
                teardown: false,
            },
        ))
    }

    /// Starting → Running, once `start` succeeded.
    ///
    /// Returns `None` if `id` is no longer the Starting run (it was stopped or
    /// canceled meanwhile). If the child already exited while we were still
    /// Starting, the run goes straight on to Idle.
    pub fn mark_running(&mut self, id: RunId) -> Option<CoreStep> {
        if !self.is_current(id) || self.state != LifecycleState::Starting {
            return None;
        }

        self.state = LifecycleState::Running;
        let mut step = CoreStep {
            events: vec![RunEvent::StateChanged(LifecycleState::Running)],
            teardown: false,
        };

        if let Some(signal) = self.early_exit.take() {
            let finished = self.finish(id, RunOutcome::Exited(signal));
            step.events.extend(finished.events);
            step.teardown = finished.teardown;
        }
        Some(step)
    }

    /// Translate one communicator event of run `id`.
    ///
    /// Events of any run other than the current one are dropped.
    pub fn on_event(&mut self, id: RunId, event: CommunicatorEvent) -> CoreStep {
        if !self.is_current(id) {
            return CoreStep::none();
        }

        match event {
            CommunicatorEvent::Output(line) => CoreStep {
                events: vec![RunEvent::Output { run: id, line }],
                teardown: false,
            },
            CommunicatorEvent::Error(line) => CoreStep {
                events: vec![RunEvent::Error { run: id, line }],
                teardown: false,
            },
            CommunicatorEvent::Exited(signal) => match self.state {
                LifecycleState::Running => self.finish(id, RunOutcome::Exited(signal)),
                // `start` is about to fail or succeed; remember the exit.
                LifecycleState::Starting => {
                    self.early_exit = Some(signal);
                    CoreStep::none()
                }
                LifecycleState::Idle => CoreStep::none(),
            },
        }
    }

    /// Starting/Running → Idle with `outcome`.
    ///
    /// A no-op for a run that already finished, so every run gets exactly one
    /// `Finished` event no matter how many paths race to end it.
    pub fn finish(&mut self, id: RunId, outcome: RunOutcome) -> CoreStep {
        if !self.is_current(id) {
            return CoreStep::none();
        }

        self.current = None;
        self.state = LifecycleState::Idle;
        self.early_exit = None;

        CoreStep {
            events: vec![
                RunEvent::Finished { run: id, outcome },
                RunEvent::StateChanged(LifecycleState::Idle),
            ],
            teardown: true,
        }
    }
}
