// ── Connection lifecycle ──
//
// Owns the connection state and the epoch counter. Every connect attempt
// opens a new epoch; anything tagged with an older one is stale.

use strum::Display;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::CoreError;

/// Upstream connection state, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) struct ReconnectCoordinator {
    state: watch::Sender<ConnectionState>,
    epoch: u64,
}

impl ReconnectCoordinator {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { state, epoch: 0 }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether `epoch` is the current, connected epoch.
    pub(crate) fn is_live(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.is_connected()
    }

    /// `Disconnected -> Connecting`, opening a new epoch.
    pub(crate) fn begin_connect(&mut self) -> Result<u64, CoreError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(CoreError::AlreadyConnected);
        }
        self.epoch += 1;
        self.state.send_replace(ConnectionState::Connecting);
        debug!(epoch = self.epoch, "connecting");
        Ok(self.epoch)
    }

    /// `Connecting -> Connected`. Returns `false` if `epoch` is stale.
    pub(crate) fn connected(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state() != ConnectionState::Connecting {
            return false;
        }
        self.state.send_replace(ConnectionState::Connected);
        info!(epoch, "connected");
        true
    }

    /// `Connecting -> Disconnected` after a failed attempt.
    pub(crate) fn connect_failed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state() != ConnectionState::Connecting {
            return false;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    /// `Connected -> Disconnected`. Returns whether the state changed.
    pub(crate) fn disconnected(&mut self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(epoch = self.epoch, "disconnected");
        true
    }

    /// Abandon the current epoch whatever the state.
    pub(crate) fn reset(&mut self) {
        self.epoch += 1;
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut coordinator = ReconnectCoordinator::new();
        let rx = coordinator.subscribe();

        let epoch = coordinator.begin_connect().unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert!(matches!(coordinator.begin_connect(), Err(CoreError::AlreadyConnected)));

        assert!(coordinator.connected(epoch));
        assert!(coordinator.is_live(epoch));

        assert!(coordinator.disconnected());
        assert!(!coordinator.disconnected());
        assert!(!coordinator.is_live(epoch));

        let next = coordinator.begin_connect().unwrap();
        assert_eq!(next, epoch + 1);
        assert!(!coordinator.connected(epoch));
        assert!(coordinator.connect_failed(next));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reset_invalidates_attempt_in_flight() {
        let mut coordinator = ReconnectCoordinator::new();
        let epoch = coordinator.begin_connect().unwrap();
        coordinator.reset();
        assert!(!coordinator.connected(epoch));
        assert_eq!(coordinator.state().to_string(), "disconnected");
    }
}
