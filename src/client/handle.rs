use crate::assistant::supervisor::SupervisorState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cheap, cloneable control handle for a running bridge.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    stop: CancellationToken,
    state: watch::Receiver<SupervisorState>,
}

impl BridgeHandle {
    pub(crate) fn new(stop: CancellationToken, state: watch::Receiver<SupervisorState>) -> Self {
        Self { stop, state }
    }

    /// Requests an orderly stop. Every loop ends at its next suspension point.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("[BridgeHandle] Stop requested.");
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Resolves once the stop signal has been raised, by either side.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}
