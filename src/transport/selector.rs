// src/transport/selector.rs

//! Choosing a transport per run.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Communicator, CommunicatorEvent, SocketCommunicator, StdioCommunicator, TransportSettings};
use crate::types::IpcMode;

/// Creates a fresh [`Communicator`] for each run.
///
/// The coordinator only depends on this trait, so tests can swap in a fake
/// transport without spawning processes.
pub trait CommunicatorFactory: Send + Sync {
    fn create(
        &self,
        mode: IpcMode,
        events: mpsc::Sender<CommunicatorEvent>,
    ) -> Arc<dyn Communicator>;
}

/// Production factory: standard-stream or loopback socket, by mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportSelector {
    settings: TransportSettings,
}

impl TransportSelector {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

impl CommunicatorFactory for TransportSelector {
    fn create(
        &self,
        mode: IpcMode,
        events: mpsc::Sender<CommunicatorEvent>,
    ) -> Arc<dyn Communicator> {
        match mode {
            IpcMode::StandardStream => Arc::new(StdioCommunicator::new(self.settings, events)),
            IpcMode::LocalSocket => Arc::new(SocketCommunicator::new(self.settings, events)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn picks_transport_by_mode() {
        let selector = TransportSelector::default();
        let (tx, _rx) = mpsc::channel(1);

        assert_eq!(
            selector.create(IpcMode::StandardStream, tx.clone()).mode(),
            IpcMode::StandardStream
        );
        assert_eq!(
            selector.create(IpcMode::LocalSocket, tx).mode(),
            IpcMode::LocalSocket
        );
    }
}
