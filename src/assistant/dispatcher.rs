use super::cleaner::{TargetScript, clean_for_script};
use super::playback::SpeechQueue;
use crate::client::connection::{CLOSED_BY_PEER, ConnectionManager, Received};
use crate::client::handlers::{Hooks, ResponseTextContext, TranscriptionContext};
use crate::error::{BridgeError, LinkFailure};
use crate::types::{InboundEvent, text_segments};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Reads service events and routes them: response text to the speech queue,
/// transcripts to the hooks, everything else to the log.
pub struct EventDispatcher {
    connection: Arc<ConnectionManager>,
    queue: SpeechQueue,
    hooks: Hooks,
    script: Option<TargetScript>,
    receive_timeout: Duration,
    close_pause: Duration,
    error_pause: Duration,
    stop: CancellationToken,
}

impl EventDispatcher {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        queue: SpeechQueue,
        hooks: Hooks,
        script: Option<TargetScript>,
        stop: CancellationToken,
    ) -> Self {
        let receive_timeout = connection.config().receive_timeout();
        let close_pause = Duration::from_millis(connection.config().receive_retry_ms);
        let error_pause = Duration::from_millis(connection.config().receive_error_pause_ms);
        Self {
            connection,
            queue,
            hooks,
            script,
            receive_timeout,
            close_pause,
            error_pause,
            stop,
        }
    }

    pub async fn run(self) -> Result<(), BridgeError> {
        info!("[Dispatcher] Started.");
        loop {
            let received = tokio::select! {
                _ = self.stop.cancelled() => break,
                received = self.connection.receive(self.receive_timeout) => received,
            };
            match received {
                Ok(Received::Timeout) => {
                    info!(
                        "[Dispatcher] No events for {:?}; connection still alive.",
                        self.receive_timeout
                    );
                }
                Ok(Received::Frame(raw)) => self.dispatch(InboundEvent::decode(&raw))?,
                Err(LinkFailure::Retryable(reason)) => {
                    let pause = if reason == CLOSED_BY_PEER {
                        self.close_pause
                    } else {
                        self.error_pause
                    };
                    warn!(
                        "[Dispatcher] Connection lost ({}); reconnecting in {:?}.",
                        reason, pause
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(LinkFailure::Fatal(reason)) => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    warn!("[Dispatcher] Giving up: {}", reason);
                    return Err(BridgeError::ConnectionError(reason));
                }
            }
        }
        info!("[Dispatcher] Stopped.");
        Ok(())
    }

    fn dispatch(&self, event: InboundEvent) -> Result<(), BridgeError> {
        match event {
            InboundEvent::TextDelta(delta) => info!("[Dispatcher] Delta: {}", delta),
            InboundEvent::TextDone(text) => info!("[Dispatcher] Response text: {}", text),
            InboundEvent::ResponseDone(output) => self.speak_response(text_segments(&output))?,
            InboundEvent::TranscriptionCompleted(transcript) => {
                info!("[Dispatcher] You said: {}", transcript);
                if let Some(hook) = &self.hooks.transcription {
                    self.fire(hook(TranscriptionContext { transcript }));
                }
            }
            InboundEvent::Error(error) => warn!("[Dispatcher] Service error: {}", error),
            InboundEvent::Other(raw) => {
                if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
                    warn!("[Dispatcher] Skipping undecodable frame: {}", raw);
                } else {
                    trace!("[Dispatcher] Ignoring event: {}", raw);
                }
            }
        }
        Ok(())
    }

    fn speak_response(&self, segments: Vec<String>) -> Result<(), BridgeError> {
        if segments.is_empty() {
            warn!("[Dispatcher] response.done carried no text segments.");
            return Ok(());
        }
        for (segment_index, raw) in segments.into_iter().enumerate() {
            let text = clean_for_script(&raw, self.script);
            if text.is_empty() {
                warn!("[Dispatcher] Segment {} is empty after cleaning: {:?}", segment_index, raw);
                continue;
            }
            info!("[Dispatcher] Queueing segment {}: {}", segment_index, text);
            self.queue.enqueue(text.clone())?;
            if let Some(hook) = &self.hooks.response_text {
                self.fire(hook(ResponseTextContext { text, segment_index }));
            }
        }
        Ok(())
    }

    /// Runs a hook on its own task so it never holds up the receive loop.
    fn fire(&self, hook: BoxFuture<'static, ()>) {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => debug!("[Dispatcher] Hook cancelled."),
                _ = hook => {}
            }
        });
    }
}
