use super::connection::{Connector, WsConnector};
use super::handle::BridgeHandle;
use super::handlers::{EventHandlerSimple, Handlers, ResponseTextContext, TranscriptionContext};
use crate::assistant::supervisor::{Collaborators, Supervisor};
use crate::audio::capture::CaptureDevice;
use crate::audio::sink::{BufferedPlayer, ProcessStreamSink, StreamingSink, TempFilePlayer};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::speech::SpeechSynthesizer;
use crate::speech::fish::FishSynthesizer;
use std::sync::Arc;
use tracing::info;

/// Assembles a [`Supervisor`] from configuration plus optional collaborator
/// overrides. Anything not overridden gets the production adapter.
pub struct VoiceBridgeBuilder<S: Send + Sync + 'static> {
    pub(crate) config: BridgeConfig,
    pub(crate) handlers: Handlers<S>,
    pub(crate) state: S,
    connector: Option<Arc<dyn Connector>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    streaming: Option<Arc<dyn StreamingSink>>,
    fallback: Option<Arc<dyn BufferedPlayer>>,
    capture: Option<Arc<dyn CaptureDevice>>,
}

impl<S: Send + Sync + 'static + Default> VoiceBridgeBuilder<S> {
    pub fn new(config: BridgeConfig) -> Self {
        Self::new_with_state(config, S::default())
    }
}

impl<S: Send + Sync + 'static> VoiceBridgeBuilder<S> {
    pub fn new_with_state(config: BridgeConfig, state: S) -> Self {
        Self {
            config,
            handlers: Handlers::default(),
            state,
            connector: None,
            synthesizer: None,
            streaming: None,
            fallback: None,
            capture: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn streaming_sink(mut self, sink: Arc<dyn StreamingSink>) -> Self {
        self.streaming = Some(sink);
        self
    }

    pub fn fallback_player(mut self, player: Arc<dyn BufferedPlayer>) -> Self {
        self.fallback = Some(player);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Called for every completed transcription of the user's speech. Runs on
    /// its own task and is cancelled when the bridge stops.
    pub fn on_transcription(
        mut self,
        handler: impl EventHandlerSimple<TranscriptionContext, S> + 'static,
    ) -> Self {
        self.handlers.on_transcription = Some(Arc::new(handler));
        self
    }

    /// Called for every cleaned response segment queued for speech.
    pub fn on_response_text(
        mut self,
        handler: impl EventHandlerSimple<ResponseTextContext, S> + 'static,
    ) -> Self {
        self.handlers.on_response_text = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<(Supervisor, BridgeHandle), BridgeError> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                if self.config.realtime.api_key.trim().is_empty() {
                    return Err(BridgeError::Config("realtime api key is empty".to_string()));
                }
                Arc::new(WsConnector::new(
                    self.config.realtime.endpoint(),
                    self.config.realtime.api_key.clone(),
                ))
            }
        };
        let synthesizer = match self.synthesizer {
            Some(synthesizer) => synthesizer,
            None => Arc::new(FishSynthesizer::new(self.config.speech.clone())),
        };
        let streaming = match self.streaming {
            Some(streaming) => streaming,
            None => Arc::new(ProcessStreamSink::new(
                self.config.playback.stream_command.clone(),
            )),
        };
        let fallback = match self.fallback {
            Some(fallback) => fallback,
            None => Arc::new(TempFilePlayer::new(
                self.config.playback.fallback_command.clone(),
            )),
        };
        let capture = match self.capture {
            Some(capture) => capture,
            None => default_capture(&self.config)?,
        };

        let hooks = self.handlers.bind(Arc::new(self.state));
        let parts = Collaborators {
            connector,
            synthesizer,
            streaming,
            fallback,
            capture,
            hooks,
        };
        let supervisor = Supervisor::new(self.config, parts);
        let handle = supervisor.handle();
        info!("[Builder] Voice bridge assembled.");
        Ok((supervisor, handle))
    }
}

#[cfg(feature = "audio-io")]
fn default_capture(config: &BridgeConfig) -> Result<Arc<dyn CaptureDevice>, BridgeError> {
    Ok(Arc::new(crate::audio::capture::CpalCaptureDevice::probe(
        &config.audio,
    )?))
}

#[cfg(not(feature = "audio-io"))]
fn default_capture(_config: &BridgeConfig) -> Result<Arc<dyn CaptureDevice>, BridgeError> {
    Err(BridgeError::Config(
        "no capture device configured and the audio-io feature is disabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::supervisor::SupervisorState;
    use crate::testing::{
        MicProbe, MockConnector, RecordingPlayer, RecordingSink, RecordingSynth, ScriptedCapture,
        Timeline,
    };

    #[derive(Default)]
    struct Counter;

    fn mocked(config: BridgeConfig) -> VoiceBridgeBuilder<Counter> {
        let timeline = Timeline::default();
        VoiceBridgeBuilder::new(config)
            .connector(Arc::new(MockConnector::new()))
            .synthesizer(Arc::new(RecordingSynth::new(timeline.clone(), MicProbe::default())))
            .streaming_sink(Arc::new(RecordingSink::default()))
            .fallback_player(Arc::new(RecordingPlayer::new(timeline, MicProbe::default())))
            .capture(Arc::new(ScriptedCapture::new(48_000, 2)))
    }

    async fn noop(_ctx: TranscriptionContext, _state: Arc<Counter>) {}

    #[test]
    fn builds_with_overrides_and_starts_idle() {
        let (supervisor, handle) = mocked(BridgeConfig::default())
            .on_transcription(noop)
            .build()
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(handle.state(), SupervisorState::Idle);
        assert!(!handle.is_stopped());
    }

    #[test]
    fn default_connector_needs_an_api_key() {
        let result = VoiceBridgeBuilder::<Counter>::new(BridgeConfig::default())
            .synthesizer(Arc::new(RecordingSynth::new(Timeline::default(), MicProbe::default())))
            .capture(Arc::new(ScriptedCapture::new(24_000, 1)))
            .build();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
