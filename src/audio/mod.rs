pub mod capture;
pub mod sink;

pub use capture::{AudioSource, CaptureDevice, select_capture_rate};
#[cfg(feature = "audio-io")]
pub use capture::CpalCaptureDevice;
pub use sink::{BufferedPlayer, ProcessStreamSink, SinkSession, StreamingSink, TempFilePlayer};
