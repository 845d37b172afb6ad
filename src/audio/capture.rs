//! Microphone capture.

use crate::assistant::mic::MicMonitor;
use crate::error::BridgeError;
use async_trait::async_trait;
use tracing::info;

/// An input device that can be opened once per pipeline run.
pub trait CaptureDevice: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Starts capturing. Samples produced while `mic` reports muted are
    /// dropped at the source.
    fn open(&self, mic: MicMonitor) -> Result<Box<dyn AudioSource>, BridgeError>;
}

/// Interleaved PCM16 at the device's rate and channel count.
#[async_trait]
pub trait AudioSource: Send {
    /// Next block of captured samples. Must be cancel-safe.
    async fn read_chunk(&mut self) -> Result<Vec<i16>, BridgeError>;

    /// Drops anything captured but not yet read.
    fn discard_pending(&mut self);
}

/// First preferred rate that opens, or `default` when none does. Candidates
/// are tried in order and the search stops at the first success.
pub fn select_capture_rate<F>(preferences: &[u32], mut opens: F, default: u32) -> u32
where
    F: FnMut(u32) -> bool,
{
    match preferences.iter().copied().find(|&rate| opens(rate)) {
        Some(rate) => {
            info!("[Capture] Using capture rate {}Hz.", rate);
            rate
        }
        None => {
            info!(
                "[Capture] No preferred rate opened, falling back to {}Hz.",
                default
            );
            default
        }
    }
}

#[cfg(feature = "audio-io")]
pub use cpal_device::CpalCaptureDevice;

#[cfg(feature = "audio-io")]
mod cpal_device {
    use super::{AudioSource, CaptureDevice, select_capture_rate};
    use crate::assistant::mic::MicMonitor;
    use crate::config::AudioConfig;
    use crate::error::BridgeError;
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, StreamConfig};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, error, info, warn};

    const CAPTURE_QUEUE_BLOCKS: usize = 64;

    /// The default input device, opened with i16 samples at a probed rate.
    pub struct CpalCaptureDevice {
        sample_rate: u32,
        channels: u16,
    }

    impl CpalCaptureDevice {
        pub fn probe(config: &AudioConfig) -> Result<Self, BridgeError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| BridgeError::AudioDevice("No input device available".into()))?;
            info!(
                "[Capture] Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let ranges: Vec<cpal::SupportedStreamConfigRange> = device
                .supported_input_configs()
                .map_err(|e| BridgeError::AudioDevice(format!("Failed to query configs: {}", e)))?
                .filter(|c| c.sample_format() == SampleFormat::I16)
                .collect();
            if ranges.is_empty() {
                return Err(BridgeError::AudioDevice("No i16 input config found".into()));
            }

            let channels_for = |rate: u32| {
                ranges
                    .iter()
                    .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
                    .map(|r| r.channels())
                    .min()
            };
            // Some backends reject an advertised rate when the stream is built.
            let opens = |rate: u32| {
                channels_for(rate).is_some_and(|channels| opens_at(&device, rate, channels))
            };
            let sample_rate = select_capture_rate(
                &config.capture_rate_preferences,
                opens,
                config.default_capture_rate,
            );
            let channels = channels_for(sample_rate).unwrap_or(1);

            Ok(Self {
                sample_rate,
                channels,
            })
        }
    }

    impl CaptureDevice for CpalCaptureDevice {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn open(&self, mic: MicMonitor) -> Result<Box<dyn AudioSource>, BridgeError> {
            let (block_tx, block_rx) = mpsc::channel::<Vec<i16>>(CAPTURE_QUEUE_BLOCKS);
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), BridgeError>>();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let running = Arc::new(AtomicBool::new(true));
            let config = StreamConfig {
                channels: self.channels,
                sample_rate: SampleRate(self.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            // cpal streams are not Send; the stream lives on its own thread.
            let thread_running = running.clone();
            std::thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || {
                    let stream = match build_stream(&config, block_tx, mic) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.blocking_recv();
                    thread_running.store(false, Ordering::SeqCst);
                    drop(stream);
                    debug!("[Capture] Capture thread finished.");
                })
                .map_err(|e| BridgeError::AudioDevice(format!("capture thread: {}", e)))?;

            ready_rx
                .recv()
                .map_err(|_| BridgeError::AudioDevice("capture thread exited".into()))??;
            info!(
                "[Capture] Capturing {}Hz {}ch.",
                self.sample_rate, self.channels
            );
            Ok(Box::new(CpalSource {
                blocks: block_rx,
                _stop: stop_tx,
                running,
            }))
        }
    }

    /// Builds and immediately drops an input stream at `rate`.
    fn opens_at(device: &cpal::Device, rate: u32, channels: u16) -> bool {
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        match device.build_input_stream(
            &config,
            |_: &[i16], _: &cpal::InputCallbackInfo| {},
            |err| debug!("[Capture] Trial stream error: {}", err),
            None,
        ) {
            Ok(_stream) => true,
            Err(e) => {
                warn!("[Capture] {}Hz is advertised but failed to open: {}", rate, e);
                false
            }
        }
    }

    fn build_stream(
        config: &StreamConfig,
        block_tx: mpsc::Sender<Vec<i16>>,
        mic: MicMonitor,
    ) -> Result<cpal::Stream, BridgeError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| BridgeError::AudioDevice("No input device available".into()))?;
        let stream = device
            .build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if mic.is_muted() || data.is_empty() {
                        return;
                    }
                    match block_tx.try_send(data.to_vec()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("[Capture] Capture queue full, dropping block.")
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                },
                |err| error!("[Capture] Stream error: {}", err),
                None,
            )
            .map_err(|e| BridgeError::AudioDevice(format!("Failed to build input stream: {}", e)))?;
        stream
            .play()
            .map_err(|e| BridgeError::AudioDevice(format!("Failed to start input stream: {}", e)))?;
        Ok(stream)
    }

    struct CpalSource {
        blocks: mpsc::Receiver<Vec<i16>>,
        // Dropping the sender ends the capture thread.
        _stop: oneshot::Sender<()>,
        running: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AudioSource for CpalSource {
        async fn read_chunk(&mut self) -> Result<Vec<i16>, BridgeError> {
            match self.blocks.recv().await {
                Some(block) => Ok(block),
                None => Err(BridgeError::AudioDevice(format!(
                    "capture stream ended (thread running: {})",
                    self.running.load(Ordering::SeqCst)
                ))),
            }
        }

        fn discard_pending(&mut self) {
            let mut dropped = 0;
            while self.blocks.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("[Capture] Discarded {} stale blocks.", dropped);
            }
        }
    }
}
