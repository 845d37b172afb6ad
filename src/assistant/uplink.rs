use super::mic::{MicMonitor, MicState};
use crate::audio::capture::AudioSource;
use crate::client::SampleRateAdapter;
use crate::client::connection::ConnectionManager;
use crate::error::{BridgeError, LinkFailure};
use crate::types::{AudioFrame, ClientEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub chunk_samples: usize,
    pub pace: Duration,
    /// Pause before retrying a frame after a failed send.
    pub send_retry: Duration,
    /// Pause before retrying while no link is installed.
    pub link_wait: Duration,
}

/// Pushes microphone audio, or silence while muted, to the realtime service
/// at a steady cadence. Live and silence frames are both exactly one chunk.
pub struct AudioUplink {
    connection: Arc<ConnectionManager>,
    source: Box<dyn AudioSource>,
    adapter: SampleRateAdapter,
    /// Resampled audio not yet framed.
    pending: Vec<i16>,
    mic: MicMonitor,
    settings: UplinkSettings,
    stop: CancellationToken,
}

enum Tick {
    Frame(AudioFrame),
    /// Nothing to send this tick (mute edge).
    Skip,
    Stop,
}

impl AudioUplink {
    pub fn new(
        connection: Arc<ConnectionManager>,
        source: Box<dyn AudioSource>,
        adapter: SampleRateAdapter,
        mic: MicMonitor,
        settings: UplinkSettings,
        stop: CancellationToken,
    ) -> Self {
        Self {
            connection,
            source,
            adapter,
            pending: Vec::new(),
            mic,
            settings,
            stop,
        }
    }

    pub async fn run(mut self) -> Result<(), BridgeError> {
        info!("[Uplink] Started.");
        let mut was_muted = self.mic.is_muted();
        let mut frames_sent: u64 = 0;

        loop {
            let muted = self.mic.is_muted();
            if was_muted && !muted {
                debug!("[Uplink] Microphone unmuted; discarding stale capture.");
                self.source.discard_pending();
                self.adapter.discard_buffered();
                self.pending.clear();
            }
            was_muted = muted;

            let tick = if muted {
                Tick::Frame(AudioFrame::silence(self.settings.chunk_samples))
            } else {
                self.capture_tick().await?
            };

            match tick {
                Tick::Stop => break,
                Tick::Skip => {}
                Tick::Frame(frame) => {
                    if !self.send_with_retry(&frame).await? {
                        break;
                    }
                    frames_sent += 1;
                    trace!(
                        "[Uplink] Sent {:?} frame #{} ({} bytes).",
                        frame.kind, frames_sent, frame.len_bytes()
                    );
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.settings.pace) => {}
            }
        }
        info!("[Uplink] Stopped after {} frames.", frames_sent);
        Ok(())
    }

    /// Reads device blocks until one full chunk is resampled. Whatever the
    /// device delivered beyond that stays in `pending` for the next tick, so
    /// the uplink drains capture at least as fast as it is produced.
    async fn capture_tick(&mut self) -> Result<Tick, BridgeError> {
        let chunk = self.settings.chunk_samples;
        while self.pending.len() < chunk {
            let block = tokio::select! {
                _ = self.stop.cancelled() => return Ok(Tick::Stop),
                _ = wait_for_mute(&mut self.mic) => return Ok(Tick::Skip),
                block = self.source.read_chunk() => block?,
            };
            let samples = self.adapter.process(&block)?;
            self.pending.extend_from_slice(&samples);
        }
        let frame = AudioFrame::live(&self.pending[..chunk]);
        self.pending.drain(..chunk);
        Ok(Tick::Frame(frame))
    }

    /// Returns `false` when stopped before the frame could be sent.
    async fn send_with_retry(&mut self, frame: &AudioFrame) -> Result<bool, BridgeError> {
        let event = ClientEvent::audio_append(frame);
        loop {
            if self.stop.is_cancelled() {
                return Ok(false);
            }
            match self.connection.send(&event).await {
                Ok(()) => return Ok(true),
                Err(LinkFailure::Retryable(reason)) => {
                    let pause = if self.connection.is_open().await {
                        self.settings.send_retry
                    } else {
                        self.settings.link_wait
                    };
                    debug!(
                        "[Uplink] {:?} frame not sent ({}); retrying in {:?}.",
                        frame.kind, reason, pause
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(LinkFailure::Fatal(reason)) => {
                    if self.stop.is_cancelled() {
                        return Ok(false);
                    }
                    warn!("[Uplink] Giving up: {}", reason);
                    return Err(BridgeError::ConnectionError(reason));
                }
            }
        }
    }
}

/// Resolves on the next mute edge. Never resolves once the switch is gone.
async fn wait_for_mute(mic: &mut MicMonitor) {
    loop {
        match mic.changed().await {
            Some(MicState::Muted) => return,
            Some(MicState::Unmuted) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}
