//! Wire types for the realtime conversational service and the audio frames
//! that flow through the uplink.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ---- Outbound ----

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

impl ClientEvent {
    pub fn session_update(session: &SessionConfig) -> Self {
        ClientEvent::SessionUpdate {
            session: session.clone(),
        }
    }

    /// Base64-encodes the frame's PCM bytes into an `input_audio_buffer.append` event.
    pub fn audio_append(frame: &AudioFrame) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: base64::engine::general_purpose::STANDARD.encode(&frame.pcm),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Session description sent once after every successful connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string()],
            instructions: None,
            voice: None,
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: None,
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InputAudioTranscription {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

// ---- Inbound ----

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseBody,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
struct ResponseBody {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OutputItem {
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TextDelta(String),
    TextDone(String),
    ResponseDone(Vec<OutputItem>),
    TranscriptionCompleted(String),
    Error(serde_json::Value),
    Other(String),
}

impl InboundEvent {
    /// Decodes a text frame. Unknown event types and payloads that fail to
    /// decode become `Other` carrying the raw frame.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<ServerEvent>(raw) {
            Ok(ServerEvent::TextDelta { delta }) => InboundEvent::TextDelta(delta),
            Ok(ServerEvent::TextDone { text }) => InboundEvent::TextDone(text),
            Ok(ServerEvent::ResponseDone { response }) => {
                InboundEvent::ResponseDone(response.output)
            }
            Ok(ServerEvent::TranscriptionCompleted { transcript }) => {
                InboundEvent::TranscriptionCompleted(transcript)
            }
            Ok(ServerEvent::Error { error }) => InboundEvent::Error(error),
            Err(_) => InboundEvent::Other(raw.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::TextDelta(_) => "response.text.delta",
            InboundEvent::TextDone(_) => "response.text.done",
            InboundEvent::ResponseDone(_) => "response.done",
            InboundEvent::TranscriptionCompleted(_) => {
                "conversation.item.input_audio_transcription.completed"
            }
            InboundEvent::Error(_) => "error",
            InboundEvent::Other(_) => "other",
        }
    }
}

/// Raw text of every `text` content part of every `message` output item, in order.
pub fn text_segments(output: &[OutputItem]) -> Vec<String> {
    output
        .iter()
        .filter(|item| item.item_type == "message")
        .flat_map(|item| item.content.iter())
        .filter(|part| part.part_type == "text")
        .filter_map(|part| part.text.clone())
        .collect()
}

// ---- Audio frames ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Live,
    Silence,
}

/// PCM16 little-endian mono audio at the service rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub kind: FrameKind,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn live(samples: &[i16]) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            kind: FrameKind::Live,
            pcm,
        }
    }

    /// A zeroed frame of `chunk_samples` samples.
    pub fn silence(chunk_samples: usize) -> Self {
        Self {
            kind: FrameKind::Silence,
            pcm: vec![0u8; chunk_samples * 2],
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.pcm.len()
    }
}
