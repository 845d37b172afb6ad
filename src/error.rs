use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to send message over the realtime link")]
    SendError,

    #[error("Realtime link is not open")]
    NotReady,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audio resampling error: {0}")]
    AudioResamplingError(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stopped")]
    Stopped,

    #[error("Restart budget exhausted after {0} restarts")]
    RestartBudgetExhausted(u32),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Synthesis(e.to_string())
    }
}

/// Outcome of a failed link operation.
///
/// `Retryable` means the caller should wait for a reconnect and try again;
/// `Fatal` means reconnection is disabled and the caller should exit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    #[error("retryable link failure: {0}")]
    Retryable(String),

    #[error("fatal link failure: {0}")]
    Fatal(String),
}

impl LinkFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkFailure::Retryable(_))
    }
}
