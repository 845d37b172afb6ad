use crate::client::connection::ConnectionManager;
use crate::error::BridgeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pings the service on a fixed interval. A missing pong drops the link so the
/// dispatcher reconnects; it never ends the run.
pub struct Keepalive {
    connection: Arc<ConnectionManager>,
    interval: Duration,
    pong_timeout: Duration,
    stop: CancellationToken,
}

impl Keepalive {
    pub fn new(connection: Arc<ConnectionManager>, stop: CancellationToken) -> Self {
        let interval = connection.config().keepalive_interval();
        let pong_timeout = connection.config().pong_timeout();
        Self {
            connection,
            interval,
            pong_timeout,
            stop,
        }
    }

    pub async fn run(self) -> Result<(), BridgeError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.connection.is_open().await {
                debug!("[Keepalive] Link not open; skipping ping.");
                continue;
            }
            let outcome = tokio::select! {
                _ = self.stop.cancelled() => break,
                outcome = self.connection.ping(self.pong_timeout) => outcome,
            };
            match outcome {
                Ok(()) => debug!("[Keepalive] Pong received."),
                Err(failure) => warn!("[Keepalive] {}; link dropped.", failure),
            }
        }
        info!("[Keepalive] Stopped.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connection::Received;
    use crate::config::ReconnectConfig;
    use crate::testing::{MockConnector, init_test_logger};
    use crate::types::SessionConfig;

    async fn setup(config: ReconnectConfig) -> (Arc<MockConnector>, Arc<ConnectionManager>, CancellationToken) {
        init_test_logger();
        let connector = Arc::new(MockConnector::new());
        let stop = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            SessionConfig::default(),
            config,
            stop.clone(),
        ));
        manager.connect().await.unwrap();
        (connector, manager, stop)
    }

    /// Stands in for the dispatcher, which is what surfaces pongs.
    fn spawn_reader(manager: Arc<ConnectionManager>, stop: CancellationToken) {
        tokio::spawn(async move {
            while !stop.is_cancelled() {
                if let Ok(Received::Frame(_)) | Ok(Received::Timeout) =
                    manager.receive(Duration::from_secs(1)).await
                {
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_link() {
        let (connector, manager, stop) = setup(ReconnectConfig::default()).await;
        connector.link(0).answer_pings();
        spawn_reader(manager.clone(), stop.clone());

        let task = tokio::spawn(Keepalive::new(manager.clone(), stop.clone()).run());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(manager.is_open().await);
        assert_eq!(connector.link_count(), 1);

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_drops_the_link_without_ending_the_loop() {
        let config = ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        };
        let (connector, manager, stop) = setup(config).await;
        spawn_reader(manager.clone(), stop.clone());

        let task = tokio::spawn(Keepalive::new(manager.clone(), stop.clone()).run());
        // First ping at 10s, pong deadline at 15s.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!manager.is_open().await);
        assert!(connector.link(0).is_closed());
        assert!(!task.is_finished());

        stop.cancel();
        task.await.unwrap().unwrap();
    }
}
