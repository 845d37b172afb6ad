//! Bounded restart loop around one streaming run.
//!
//! A run owns a fresh connection, microphone state and speech queue, and
//! drives four loops (uplink, dispatcher, playback, keepalive) under a child
//! of the global stop token. The first loop to fail ends the run; the
//! supervisor tears it down and starts over until the restart ceiling is hit.

use super::dispatcher::EventDispatcher;
use super::keepalive::Keepalive;
use super::mic::{MicMonitor, mic_channel};
use super::playback::{PlaybackConsumer, speech_queue};
use super::uplink::{AudioUplink, UplinkSettings};
use crate::audio::capture::{AudioSource, CaptureDevice};
use crate::audio::sink::{BufferedPlayer, StreamingSink};
use crate::client::SampleRateAdapter;
use crate::client::connection::{ConnectionManager, Connector};
use crate::client::handle::BridgeHandle;
use crate::client::handlers::Hooks;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::speech::SpeechSynthesizer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long loops get to wind down after their run is cancelled.
const RUN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connect,
    Streaming,
    Reconnecting,
    /// Restart ceiling reached. Terminal.
    Failed,
    /// Stopped from outside. Terminal.
    Stopped,
}

/// External services and devices a run is assembled from.
pub(crate) struct Collaborators {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) synthesizer: Arc<dyn SpeechSynthesizer>,
    pub(crate) streaming: Arc<dyn StreamingSink>,
    pub(crate) fallback: Arc<dyn BufferedPlayer>,
    pub(crate) capture: Arc<dyn CaptureDevice>,
    pub(crate) hooks: Hooks,
}

/// Name of a finished loop and how it ended.
type LoopExit = (&'static str, Result<(), BridgeError>);

enum RunOutcome {
    Stopped,
    Failed(BridgeError),
}

pub struct Supervisor {
    config: BridgeConfig,
    parts: Collaborators,
    state_tx: watch::Sender<SupervisorState>,
    stop: CancellationToken,
    current: TokioMutex<Option<Arc<ConnectionManager>>>,
    cleaned_up: AtomicBool,
    cleanup_runs: AtomicU32,
}

impl Supervisor {
    pub(crate) fn new(config: BridgeConfig, parts: Collaborators) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            config,
            parts,
            state_tx,
            stop: CancellationToken::new(),
            current: TokioMutex::new(None),
            cleaned_up: AtomicBool::new(false),
            cleanup_runs: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle::new(self.stop.clone(), self.state_tx.subscribe())
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("[Supervisor] {:?} -> {:?}", previous, state);
        }
    }

    /// Runs until stopped (`Ok`) or until the restart ceiling is reached.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let max_restarts = self.config.supervisor.max_restarts;
        let restart_delay = Duration::from_millis(self.config.supervisor.restart_delay_ms);
        let mut restarts: u32 = 0;

        loop {
            match self.run_once().await {
                RunOutcome::Stopped => {
                    self.set_state(SupervisorState::Stopped);
                    self.full_cleanup().await;
                    return Ok(());
                }
                RunOutcome::Failed(e) => {
                    restarts += 1;
                    error!(
                        "[Supervisor] Run failed: {} (restart {}/{}).",
                        e, restarts, max_restarts
                    );
                    if restarts >= max_restarts {
                        self.set_state(SupervisorState::Failed);
                        self.full_cleanup().await;
                        return Err(BridgeError::RestartBudgetExhausted(restarts));
                    }
                    self.set_state(SupervisorState::Reconnecting);
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            self.set_state(SupervisorState::Stopped);
                            self.full_cleanup().await;
                            return Ok(());
                        }
                        _ = tokio::time::sleep(restart_delay) => {}
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> RunOutcome {
        if self.stop.is_cancelled() {
            return RunOutcome::Stopped;
        }
        self.set_state(SupervisorState::Connect);

        let run_token = self.stop.child_token();
        let connection = Arc::new(ConnectionManager::new(
            self.parts.connector.clone(),
            self.config.realtime.session_config(),
            self.config.reconnect.clone(),
            run_token.clone(),
        ));
        *self.current.lock().await = Some(connection.clone());

        match connection.connect().await {
            Ok(()) => {}
            Err(BridgeError::Stopped) => return RunOutcome::Stopped,
            Err(e) => return RunOutcome::Failed(e),
        }

        let (mic, monitor) = mic_channel();
        let (queue, jobs) = speech_queue();

        let opened = self.open_capture(monitor.clone()).map(|(source, adapter)| {
            let settings = UplinkSettings {
                chunk_samples: self.config.audio.chunk_samples,
                pace: Duration::from_millis(self.config.audio.uplink_pace_ms),
                send_retry: Duration::from_millis(self.config.reconnect.send_retry_ms),
                link_wait: Duration::from_millis(self.config.reconnect.link_wait_ms),
            };
            AudioUplink::new(
                connection.clone(),
                source,
                adapter,
                monitor,
                settings,
                run_token.clone(),
            )
        });
        let uplink = match opened {
            Ok(uplink) => uplink,
            Err(e) => {
                self.partial_cleanup(&run_token, &connection, None).await;
                return RunOutcome::Failed(e);
            }
        };

        let dispatcher = EventDispatcher::new(
            connection.clone(),
            queue.clone(),
            self.parts.hooks.clone(),
            self.config.audio.target_script,
            run_token.clone(),
        );
        let playback = PlaybackConsumer::new(
            jobs,
            mic,
            self.parts.synthesizer.clone(),
            self.parts.streaming.clone(),
            self.parts.fallback.clone(),
            self.config.playback.clone(),
            run_token.clone(),
        );
        let keepalive = Keepalive::new(connection.clone(), run_token.clone());

        let mut tasks: JoinSet<LoopExit> = JoinSet::new();
        tasks.spawn(async move { ("uplink", uplink.run().await) });
        tasks.spawn(async move { ("dispatcher", dispatcher.run().await) });
        tasks.spawn(async move { ("playback", playback.run().await) });
        tasks.spawn(async move { ("keepalive", keepalive.run().await) });
        self.set_state(SupervisorState::Streaming);

        let outcome = loop {
            let joined = tokio::select! {
                _ = self.stop.cancelled() => break RunOutcome::Stopped,
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => {
                    break if self.stop.is_cancelled() {
                        RunOutcome::Stopped
                    } else {
                        RunOutcome::Failed(BridgeError::InternalError("all loops exited".to_string()))
                    };
                }
                Some(Ok((name, Ok(())))) => {
                    if self.stop.is_cancelled() {
                        break RunOutcome::Stopped;
                    }
                    break RunOutcome::Failed(BridgeError::InternalError(format!(
                        "{} loop exited unexpectedly",
                        name
                    )));
                }
                Some(Ok((name, Err(e)))) => {
                    warn!("[Supervisor] {} loop failed: {}", name, e);
                    break RunOutcome::Failed(e);
                }
                Some(Err(join_error)) => {
                    break RunOutcome::Failed(BridgeError::InternalError(format!(
                        "loop task panicked: {}",
                        join_error
                    )));
                }
            }
        };

        queue.shutdown();
        self.partial_cleanup(&run_token, &connection, Some(&mut tasks)).await;
        outcome
    }

    fn open_capture(
        &self,
        monitor: MicMonitor,
    ) -> Result<(Box<dyn AudioSource>, SampleRateAdapter), BridgeError> {
        let capture = &self.parts.capture;
        let adapter = SampleRateAdapter::new(capture.sample_rate(), capture.channels())?;
        let source = capture.open(monitor)?;
        info!(
            "[Supervisor] Capture open at {} Hz, {} channel(s).",
            capture.sample_rate(),
            capture.channels()
        );
        Ok((source, adapter))
    }

    /// Ends one run: cancels its loops, drops queued speech and closes its
    /// connection. The supervisor itself stays usable.
    async fn partial_cleanup(
        &self,
        run_token: &CancellationToken,
        connection: &ConnectionManager,
        tasks: Option<&mut JoinSet<LoopExit>>,
    ) {
        run_token.cancel();
        if let Some(tasks) = tasks {
            let drained = tokio::time::timeout(RUN_DRAIN_TIMEOUT, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("[Supervisor] Loops did not stop in time; aborting them.");
                tasks.shutdown().await;
            }
        }
        connection.close().await;
    }

    /// Releases everything. Runs at most once per supervisor.
    async fn full_cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanup_runs.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        if let Some(connection) = self.current.lock().await.take() {
            connection.shutdown().await;
        }
        info!("[Supervisor] Cleanup complete.");
    }

    #[cfg(test)]
    pub(crate) fn cleanup_runs(&self) -> u32 {
        self.cleanup_runs.load(Ordering::SeqCst)
    }
}
