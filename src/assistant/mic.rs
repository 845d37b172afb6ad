//! Microphone mute state shared between the playback consumer and the uplink.
//!
//! The writer half ([`MicSwitch`]) is not `Clone`, so only one owner can ever
//! change the state. Readers ([`MicMonitor`]) can be cloned freely and may be
//! consulted from synchronous contexts such as a device callback.

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    Muted,
    Unmuted,
}

#[derive(Debug, Clone, Copy)]
struct MicStatus {
    state: MicState,
    transitions: u64,
}

/// Creates a linked writer/reader pair, starting unmuted.
pub fn mic_channel() -> (MicSwitch, MicMonitor) {
    let (tx, rx) = watch::channel(MicStatus {
        state: MicState::Unmuted,
        transitions: 0,
    });
    (MicSwitch { tx }, MicMonitor { rx })
}

#[derive(Debug)]
pub struct MicSwitch {
    tx: watch::Sender<MicStatus>,
}

impl MicSwitch {
    pub fn mute(&self) {
        if self.set(MicState::Muted) {
            info!("[Mic] Muted (uplink sends silence).");
        }
    }

    pub fn unmute(&self) {
        if self.set(MicState::Unmuted) {
            info!("[Mic] Unmuted.");
        }
    }

    fn set(&self, state: MicState) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            status.transitions += 1;
            true
        })
    }

    pub fn state(&self) -> MicState {
        self.tx.borrow().state
    }

    pub fn monitor(&self) -> MicMonitor {
        MicMonitor {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicMonitor {
    rx: watch::Receiver<MicStatus>,
}

impl MicMonitor {
    pub fn state(&self) -> MicState {
        self.rx.borrow().state
    }

    pub fn is_muted(&self) -> bool {
        self.state() == MicState::Muted
    }

    /// Number of mute/unmute edges since the channel was created.
    pub fn transitions(&self) -> u64 {
        self.rx.borrow().transitions
    }

    /// Waits for the next state change. Returns `None` once the switch is dropped.
    pub async fn changed(&mut self) -> Option<MicState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unmuted_and_follows_switch() {
        let (switch, monitor) = mic_channel();
        let other = monitor.clone();
        assert!(!monitor.is_muted());
        switch.mute();
        assert!(monitor.is_muted());
        assert!(other.is_muted());
        switch.unmute();
        assert_eq!(monitor.state(), MicState::Unmuted);
        assert_eq!(switch.state(), MicState::Unmuted);
    }

    #[test]
    fn repeated_writes_are_not_edges() {
        let (switch, monitor) = mic_channel();
        switch.unmute();
        assert_eq!(monitor.transitions(), 0);
        switch.mute();
        switch.mute();
        switch.unmute();
        assert_eq!(monitor.transitions(), 2);
    }

    #[tokio::test]
    async fn monitor_observes_edges() {
        let (switch, mut monitor) = mic_channel();
        switch.mute();
        assert_eq!(monitor.changed().await, Some(MicState::Muted));
        switch.unmute();
        assert_eq!(monitor.changed().await, Some(MicState::Unmuted));
        drop(switch);
        assert_eq!(monitor.changed().await, None);
    }
}
