//! Serialized speech output.
//!
//! Jobs are spoken one at a time in enqueue order. The consumer owns the
//! [`MicSwitch`]: the microphone is muted before synthesis starts and only
//! unmuted after playback has drained and the settle delay has passed.

use super::mic::MicSwitch;
use crate::audio::sink::{BufferedPlayer, SinkSession, StreamingSink};
use crate::config::PlaybackConfig;
use crate::error::BridgeError;
use crate::speech::{AudioByteStream, SpeechSynthesizer};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechJob {
    Speak(String),
    /// Drops whatever is still queued and ends the consumer.
    Shutdown,
}

/// Producer side of the speech queue.
#[derive(Debug, Clone)]
pub struct SpeechQueue {
    tx: mpsc::UnboundedSender<SpeechJob>,
}

pub fn speech_queue() -> (SpeechQueue, mpsc::UnboundedReceiver<SpeechJob>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SpeechQueue { tx }, rx)
}

impl SpeechQueue {
    pub fn enqueue(&self, text: String) -> Result<(), BridgeError> {
        self.tx
            .send(SpeechJob::Speak(text))
            .map_err(|_| BridgeError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SpeechJob::Shutdown);
    }
}

/// Unmutes on drop, so the microphone comes back even if a job is cancelled.
struct MuteGuard<'a>(&'a MicSwitch);

impl<'a> MuteGuard<'a> {
    fn engage(mic: &'a MicSwitch) -> Self {
        mic.mute();
        Self(mic)
    }
}

impl Drop for MuteGuard<'_> {
    fn drop(&mut self) {
        self.0.unmute();
    }
}

pub struct PlaybackConsumer {
    jobs: mpsc::UnboundedReceiver<SpeechJob>,
    speaker: Speaker,
}

/// Everything a single job needs, kept apart from the job receiver.
struct Speaker {
    mic: MicSwitch,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    streaming: Arc<dyn StreamingSink>,
    fallback: Arc<dyn BufferedPlayer>,
    config: PlaybackConfig,
    stop: CancellationToken,
}

impl PlaybackConsumer {
    pub fn new(
        jobs: mpsc::UnboundedReceiver<SpeechJob>,
        mic: MicSwitch,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        streaming: Arc<dyn StreamingSink>,
        fallback: Arc<dyn BufferedPlayer>,
        config: PlaybackConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            speaker: Speaker {
                mic,
                synthesizer,
                streaming,
                fallback,
                config,
                stop,
            },
        }
    }

    pub async fn run(mut self) -> Result<(), BridgeError> {
        info!("[Playback] Consumer started.");
        loop {
            let job = tokio::select! {
                _ = self.speaker.stop.cancelled() => break,
                job = self.jobs.recv() => job,
            };
            match job {
                Some(SpeechJob::Speak(text)) => self.speaker.speak(&text).await,
                Some(SpeechJob::Shutdown) => {
                    let mut dropped = 0usize;
                    while self.jobs.try_recv().is_ok() {
                        dropped += 1;
                    }
                    info!("[Playback] Shutdown requested; dropped {} queued jobs.", dropped);
                    break;
                }
                None => break,
            }
        }
        self.speaker.mic.unmute();
        info!("[Playback] Consumer stopped.");
        Ok(())
    }
}

impl Speaker {
    async fn speak(&self, text: &str) {
        info!("[Playback] Speaking: {}", text);
        let _mute = MuteGuard::engage(&self.mic);

        let outcome = tokio::select! {
            _ = self.stop.cancelled() => return,
            outcome = self.play(text) => outcome,
        };
        if let Err(e) = outcome {
            warn!("[Playback] Job aborted: {}", e);
        }

        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(self.config.settle_after()) => {}
        }
    }

    async fn play(&self, text: &str) -> Result<(), BridgeError> {
        tokio::time::sleep(self.config.settle_before()).await;
        let audio = self.synthesizer.synthesize(text).await?;
        match self.streaming.open().await {
            Ok(session) => Self::pump(audio, session).await,
            Err(BridgeError::SinkUnavailable(reason)) => {
                warn!("[Playback] Streaming sink unavailable ({}); buffering.", reason);
                self.play_buffered(audio).await
            }
            Err(e) => Err(e),
        }
    }

    async fn pump(
        mut audio: AudioByteStream,
        mut session: Box<dyn SinkSession>,
    ) -> Result<(), BridgeError> {
        let mut total = 0usize;
        while let Some(chunk) = audio.next().await {
            let written = match chunk {
                Ok(chunk) => session.write(&chunk).await.map(|_| chunk.len()),
                Err(e) => Err(e),
            };
            match written {
                Ok(len) => total += len,
                Err(e) => {
                    session.abort().await;
                    return Err(e);
                }
            }
        }
        debug!("[Playback] Streamed {} bytes.", total);
        session.finish().await
    }

    async fn play_buffered(&self, mut audio: AudioByteStream) -> Result<(), BridgeError> {
        let mut buffered = Vec::new();
        while let Some(chunk) = audio.next().await {
            buffered.extend_from_slice(&chunk?);
        }
        if buffered.is_empty() {
            return Err(BridgeError::Synthesis("no audio received".to_string()));
        }
        self.fallback.play(&buffered).await
    }
}
