pub mod assistant;
pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod speech;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use assistant::{Supervisor, SupervisorState};
pub use client::{BridgeHandle, ResponseTextContext, TranscriptionContext, VoiceBridgeBuilder};
pub use config::BridgeConfig;
pub use error::{BridgeError, LinkFailure};
