//! The voice assistant proper: the four loops of a streaming run and the
//! supervisor that restarts them.

pub mod cleaner;
pub mod dispatcher;
pub mod keepalive;
pub mod mic;
pub mod playback;
pub mod supervisor;
pub mod uplink;

pub use cleaner::{TargetScript, clean, clean_for_script};
pub use dispatcher::EventDispatcher;
pub use keepalive::Keepalive;
pub use mic::{MicMonitor, MicState, MicSwitch, mic_channel};
pub use playback::{PlaybackConsumer, SpeechJob, SpeechQueue, speech_queue};
pub use supervisor::{Supervisor, SupervisorState};
pub use uplink::{AudioUplink, UplinkSettings};
