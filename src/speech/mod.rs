//! Text-to-speech synthesis.

pub mod fish;

use crate::error::BridgeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use fish::FishSynthesizer;

/// Encoded audio arriving incrementally from a synthesis request.
pub type AudioByteStream = BoxStream<'static, Result<Bytes, BridgeError>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Starts synthesis of `text`. The returned stream yields encoded audio
    /// chunks as the service produces them.
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream, BridgeError>;
}
