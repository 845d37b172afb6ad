//! Runtime configuration.
//!
//! Every section has defaults matching the behaviour of the assistant out of
//! the box; only the credentials are required. [`BridgeConfig::from_env`]
//! reads them (and a few overrides) from the environment, loading a `.env`
//! file first if one exists.

use crate::assistant::cleaner::TargetScript;
use crate::client::SERVICE_CHUNK_SAMPLES;
use crate::error::BridgeError;
use crate::types::{InputAudioTranscription, SessionConfig, TurnDetection};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const FISH_TTS_URL: &str = "https://api.fish.audio/v1/tts";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub realtime: RealtimeConfig,
    pub speech: SpeechConfig,
    pub reconnect: ReconnectConfig,
    pub playback: PlaybackConfig,
    pub audio: AudioConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub instructions: Option<String>,
    pub voice: Option<String>,
    pub transcription_model: String,
    pub transcription_language: Option<String>,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: OPENAI_REALTIME_URL.to_string(),
            model: "gpt-realtime-mini-2025-10-06".to_string(),
            instructions: None,
            voice: Some("alloy".to_string()),
            transcription_model: "whisper-1".to_string(),
            transcription_language: None,
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
        }
    }
}

impl RealtimeConfig {
    pub fn endpoint(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }

    /// Text-only output session with server-side turn detection.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: vec!["text".to_string()],
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.transcription_model.clone(),
                language: self.transcription_language.clone(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: self.vad_threshold,
                prefix_padding_ms: self.vad_prefix_padding_ms,
                silence_duration_ms: self.vad_silence_duration_ms,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub api_key: String,
    pub voice_id: Option<String>,
    pub url: String,
    pub format: String,
    pub latency: String,
    pub chunk_length: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: None,
            url: FISH_TTS_URL.to_string(),
            format: "mp3".to_string(),
            latency: "balanced".to_string(),
            chunk_length: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Pause before the uplink retries a frame after a transient send failure.
    pub send_retry_ms: u64,
    /// Pause before the uplink retries when no link is installed yet.
    pub link_wait_ms: u64,
    /// Pause after the peer closes the channel cleanly.
    pub receive_retry_ms: u64,
    /// Pause after a receive error or any other abnormal loss.
    pub receive_error_pause_ms: u64,
    pub receive_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            send_retry_ms: 1_000,
            link_wait_ms: 100,
            receive_retry_ms: 1_000,
            receive_error_pause_ms: 5_000,
            receive_timeout_ms: 60_000,
            keepalive_interval_ms: 10_000,
            pong_timeout_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub settle_before_ms: u64,
    pub settle_after_ms: u64,
    /// Streaming player fed through stdin.
    pub stream_command: Vec<String>,
    /// Fallback player invoked with a temporary file path appended.
    pub fallback_command: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            settle_before_ms: 200,
            settle_after_ms: 500,
            stream_command: vec![
                "mpv".to_string(),
                "--no-video".to_string(),
                "--no-terminal".to_string(),
                "-".to_string(),
            ],
            fallback_command: vec!["mpg123".to_string()],
        }
    }
}

impl PlaybackConfig {
    pub fn settle_before(&self) -> Duration {
        Duration::from_millis(self.settle_before_ms)
    }

    pub fn settle_after(&self) -> Duration {
        Duration::from_millis(self.settle_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture rates tried in order when probing the input device.
    pub capture_rate_preferences: Vec<u32>,
    pub default_capture_rate: u32,
    /// Samples per uplink frame at the service rate.
    pub chunk_samples: usize,
    pub uplink_pace_ms: u64,
    pub target_script: Option<TargetScript>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_rate_preferences: vec![24_000, 48_000, 44_100, 32_000, 16_000],
            default_capture_rate: 48_000,
            chunk_samples: SERVICE_CHUNK_SAMPLES,
            uplink_pace_ms: 10,
            target_script: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_delay_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    /// Builds a configuration from environment variables.
    ///
    /// Required: `OPENAI_API_KEY`, `FISH_API_KEY`, `FISH_VOICE_ID`.
    /// Optional: `REALTIME_MODEL`, `REALTIME_INSTRUCTIONS`,
    /// `TRANSCRIPTION_LANGUAGE`, `SPEECH_SCRIPT` (`japanese`), `MAX_RESTARTS`.
    pub fn from_env() -> Result<Self, BridgeError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BridgeError::Config(format!("{} environment variable not set", key)))
        };

        let mut config = BridgeConfig::default();
        config.realtime.api_key = required("OPENAI_API_KEY")?;
        config.speech.api_key = required("FISH_API_KEY")?;
        config.speech.voice_id = Some(required("FISH_VOICE_ID")?);

        if let Some(model) = lookup("REALTIME_MODEL") {
            config.realtime.model = model;
        }
        if let Some(instructions) = lookup("REALTIME_INSTRUCTIONS") {
            config.realtime.instructions = Some(instructions);
        }
        if let Some(language) = lookup("TRANSCRIPTION_LANGUAGE") {
            config.realtime.transcription_language = Some(language);
        }
        if let Some(script) = lookup("SPEECH_SCRIPT") {
            config.audio.target_script = Some(script.parse()?);
        }
        if let Some(max) = lookup("MAX_RESTARTS") {
            config.supervisor.max_restarts = max
                .parse()
                .map_err(|e| BridgeError::Config(format!("MAX_RESTARTS: {}", e)))?;
        }
        Ok(config)
    }
}
