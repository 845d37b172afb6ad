pub mod builder;
pub mod handle;
pub mod handlers;

pub(crate) mod audio_input_pipeline;
pub mod connection;

pub use audio_input_pipeline::SampleRateAdapter;
pub use builder::VoiceBridgeBuilder;
pub use connection::{
    Backoff, ConnectionManager, ConnectionState, Connector, DuplexLink, Inbound, Received,
    WsConnector,
};
pub use handle::BridgeHandle;
pub use handlers::{ResponseTextContext, TranscriptionContext};

/// Sample rate (24kHz) the realtime service accepts for input audio.
pub const SERVICE_SAMPLE_RATE_HZ: u32 = 24000;
/// Number of audio channels (mono) the realtime service accepts.
pub const SERVICE_AUDIO_CHANNELS: u16 = 1;
/// Samples per uplink silence frame at the service rate.
pub const SERVICE_CHUNK_SAMPLES: usize = 1024;
