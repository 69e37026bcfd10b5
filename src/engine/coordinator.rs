// src/engine/coordinator.rs

//! Async shell around [`LifecycleCore`].
//!
//! The coordinator:
//! - creates a fresh communicator per run through a [`CommunicatorFactory`]
//! - relays communicator events to the caller from a per-run task
//! - makes sure the communicator is stopped on every way a run can end
//!
//! Shared state sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. Run events are sent on an unbounded channel while that lock is
//! held, which keeps each run's event sequence ordered.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::engine::core::{CoreStep, LifecycleCore};
use crate::engine::{LifecycleState, RunEvent, RunId, RunOutcome};
use crate::errors::{IpcError, Result};
use crate::transport::{Communicator, CommunicatorEvent, CommunicatorFactory, LaunchSpec};
use crate::types::RunRequest;

/// Capacity of the channel between a communicator and its relay task.
const COMMUNICATOR_EVENT_CAPACITY: usize = 64;

/// Single owner of the active communicator.
pub struct Coordinator<F> {
    factory: F,
    inner: Arc<Inner>,
    /// Serializes run/stop while they swap the active communicator.
    gate: tokio::sync::Mutex<()>,
}

struct Inner {
    shared: Mutex<Shared>,
    events: mpsc::UnboundedSender<RunEvent>,
    /// Deferred teardowns started by the relay after an exit.
    teardowns: TaskTracker,
}

#[derive(Default)]
struct Shared {
    core: LifecycleCore,
    active: Option<ActiveRun>,
}

struct ActiveRun {
    id: RunId,
    communicator: Arc<dyn Communicator>,
    cancel: CancellationToken,
    relay_stop: CancellationToken,
}

impl<F: CommunicatorFactory> Coordinator<F> {
    /// Create a coordinator and the receiving end of its event stream.
    pub fn new(factory: F) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared::default()),
            events,
            teardowns: TaskTracker::new(),
        });

        let coordinator = Self {
            factory,
            inner,
            gate: tokio::sync::Mutex::new(()),
        };
        (coordinator, rx)
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().core.state()
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.inner.lock().core.current()
    }

    /// Start a run and deliver its payload.
    ///
    /// Any previous run is stopped first. Returns once `start` and `send`
    /// completed; output and the final exit arrive as [`RunEvent`]s. On
    /// failure the communicator has been stopped and a `Finished` event with
    /// `Failed` (or `Canceled`) was emitted before this returns.
    pub async fn run(&self, request: RunRequest) -> Result<RunId> {
        let launch = request.launch_spec();
        let payload = request.payload;

        let (id, communicator, cancel) = {
            let _gate = self.gate.lock().await;
            self.stop_active().await;

            let (tx, rx) = mpsc::channel(COMMUNICATOR_EVENT_CAPACITY);
            let communicator = self.factory.create(launch.mode, tx);
            let cancel = CancellationToken::new();
            let relay_stop = CancellationToken::new();

            let id = {
                let mut shared = self.inner.lock();
                let (id, step) = shared.core.begin_run().map_err(|active| {
                    IpcError::Other(anyhow!("run {active} is still active"))
                })?;
                self.inner.emit(step);
                shared.active = Some(ActiveRun {
                    id,
                    communicator: Arc::clone(&communicator),
                    cancel: cancel.clone(),
                    relay_stop: relay_stop.clone(),
                });
                id
            };

            tokio::spawn(relay(
                Arc::clone(&self.inner),
                id,
                rx,
                cancel.clone(),
                relay_stop,
            ));
            (id, communicator, cancel)
        };

        info!(
            run = %id,
            mode = %launch.mode,
            interpreter = %launch.interpreter.display(),
            "run requested"
        );

        match self.drive(id, communicator.as_ref(), &launch, &payload, &cancel).await {
            Ok(()) => Ok(id),
            Err(err) => {
                let outcome = if err.is_canceled() {
                    info!(run = %id, "run canceled");
                    RunOutcome::Canceled
                } else {
                    warn!(run = %id, kind = %err.kind(), error = %err, "run failed");
                    RunOutcome::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    }
                };
                self.inner.finish(id, outcome);
                communicator.stop().await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        id: RunId,
        communicator: &dyn Communicator,
        launch: &LaunchSpec,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        communicator.start(launch, cancel.clone()).await?;

        if !self.inner.mark_running(id) {
            debug!(run = %id, "run ended while starting");
            return Err(IpcError::Canceled);
        }

        communicator.send(payload, cancel.clone()).await?;
        debug!(run = %id, "payload delivered");
        Ok(())
    }

    /// Send a follow-up message to the running session.
    pub async fn send(&self, message: &str) -> Result<()> {
        let (id, communicator, cancel) = {
            let shared = self.inner.lock();
            match &shared.active {
                Some(active) if shared.core.state() == LifecycleState::Running => (
                    active.id,
                    Arc::clone(&active.communicator),
                    active.cancel.clone(),
                ),
                _ => return Err(IpcError::NotRunning),
            }
        };

        communicator.send(message, cancel).await.inspect_err(|e| {
            debug!(run = %id, error = %e, "follow-up send failed");
        })
    }

    /// Signal the current run's cancellation.
    ///
    /// Teardown happens on whichever path observes the cancellation.
    pub fn cancel(&self) {
        let shared = self.inner.lock();
        if let Some(active) = &shared.active {
            debug!(run = %active.id, "cancellation requested");
            active.cancel.cancel();
        }
    }

    /// Stop the current run, if any, and wait for pending teardowns.
    pub async fn stop(&self) {
        let _gate = self.gate.lock().await;
        self.stop_active().await;

        let teardowns = &self.inner.teardowns;
        teardowns.close();
        teardowns.wait().await;
        teardowns.reopen();
    }

    async fn stop_active(&self) {
        let active = {
            let mut shared = self.inner.lock();
            let Some(active) = shared.active.take() else {
                return;
            };
            let step = shared.core.finish(active.id, RunOutcome::Stopped);
            self.inner.emit(step);
            active
        };

        info!(run = %active.id, "stopping run");
        active.relay_stop.cancel();
        active.communicator.stop().await;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a step's events. Callers hold the state lock.
    fn emit(&self, step: CoreStep) {
        for event in step.events {
            if self.events.send(event).is_err() {
                debug!("run event receiver dropped");
                break;
            }
        }
    }

    /// Apply a step and hand back the communicator if it must be torn down.
    fn apply(&self, shared: &mut Shared, id: RunId, step: CoreStep) -> Option<Arc<dyn Communicator>> {
        let teardown = step.teardown;
        self.emit(step);

        if !teardown {
            return None;
        }
        match shared.active.take_if(|active| active.id == id) {
            Some(active) => {
                active.relay_stop.cancel();
                Some(active.communicator)
            }
            None => None,
        }
    }

    fn mark_running(&self, id: RunId) -> bool {
        let mut shared = self.lock();
        let Some(step) = shared.core.mark_running(id) else {
            return false;
        };
        if let Some(communicator) = self.apply(&mut shared, id, step) {
            // Exited before we noticed it was running.
            drop(shared);
            self.defer_stop(id, communicator);
        }
        true
    }

    fn finish(&self, id: RunId, outcome: RunOutcome) -> Option<Arc<dyn Communicator>> {
        let mut shared = self.lock();
        let step = shared.core.finish(id, outcome);
        self.apply(&mut shared, id, step)
    }

    fn on_event(&self, id: RunId, event: CommunicatorEvent) -> Option<Arc<dyn Communicator>> {
        let mut shared = self.lock();
        let step = shared.core.on_event(id, event);
        self.apply(&mut shared, id, step)
    }

    fn is_running(&self, id: RunId) -> bool {
        let shared = self.lock();
        shared.core.is_current(id) && shared.core.state() == LifecycleState::Running
    }

    fn defer_stop(&self, id: RunId, communicator: Arc<dyn Communicator>) {
        self.teardowns.spawn(async move {
            communicator.stop().await;
            debug!(run = %id, "deferred teardown finished");
        });
    }
}

/// Forward one run's communicator events until the run ends.
async fn relay(
    inner: Arc<Inner>,
    id: RunId,
    mut rx: mpsc::Receiver<CommunicatorEvent>,
    cancel: CancellationToken,
    relay_stop: CancellationToken,
) {
    let mut cancel_seen = false;

    loop {
        tokio::select! {
            biased;
            _ = relay_stop.cancelled() => break,
            _ = cancel.cancelled(), if !cancel_seen => {
                cancel_seen = true;
                // While Starting, `run` observes the token itself.
                if inner.is_running(id) {
                    info!(run = %id, "run canceled");
                    if let Some(communicator) = inner.finish(id, RunOutcome::Canceled) {
                        communicator.stop().await;
                    }
                    break;
                }
            }
            event = rx.recv() => match event {
                Some(event) => {
                    if let Some(communicator) = inner.on_event(id, event) {
                        inner.defer_stop(id, communicator);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    debug!(run = %id, "relay finished");
}
