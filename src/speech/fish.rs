use super::{AudioByteStream, SpeechSynthesizer};
use crate::config::SpeechConfig;
use crate::error::BridgeError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Serialize, Debug)]
struct TtsRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_id: Option<&'a str>,
    format: &'a str,
    latency: &'a str,
    chunk_length: u32,
}

/// Streaming client for the Fish Audio TTS endpoint.
pub struct FishSynthesizer {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl FishSynthesizer {
    pub fn new(config: SpeechConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: SpeechConfig) -> Self {
        Self { client, config }
    }

    fn build_http_request(&self, text: &str) -> reqwest::RequestBuilder {
        let body = TtsRequest {
            text,
            reference_id: self.config.voice_id.as_deref(),
            format: &self.config.format,
            latency: &self.config.latency,
            chunk_length: self.config.chunk_length,
        };
        self.client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
    }
}

#[async_trait]
impl SpeechSynthesizer for FishSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream, BridgeError> {
        info!("[Synth] Requesting speech for {} chars.", text.chars().count());
        let response = self.build_http_request(text).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::Synthesis(format!(
                "TTS request failed with {}: {}",
                status, detail
            )));
        }
        debug!("[Synth] Streaming response started ({}).", status);

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BridgeError::from))
            .boxed())
    }
}
