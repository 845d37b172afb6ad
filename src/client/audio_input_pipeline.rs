use super::{SERVICE_AUDIO_CHANNELS, SERVICE_SAMPLE_RATE_HZ};
use crate::error::BridgeError;
use audioadapter::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};
use tracing::{debug, info, trace};

const RESAMPLER_CHUNK_FRAMES: usize = 1024;
const RESAMPLER_SUB_CHUNKS: usize = 2;

struct ResamplerState {
    resampler: Fft<f32>,
    internal_mono_buffer: Vec<f32>,
    // Pre-allocated buffer for the resampler's mono output.
    output_buffer_alloc: Vec<Vec<f32>>,
}

/// Converts captured PCM16 at the device rate and channel count to mono PCM16
/// at the service rate.
///
/// The FFT resampler keeps its filter state between calls, so consecutive
/// device chunks are treated as one continuous stream. Input is mixed down to
/// mono before resampling and buffered until a full resampler block is
/// available; a call may therefore return fewer samples than it was given, or
/// none at all. Equal rates with mono input pass through unchanged.
pub struct SampleRateAdapter {
    input_rate: u32,
    input_channels: u16,
    state: Option<ResamplerState>,
}

impl std::fmt::Debug for SampleRateAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRateAdapter")
            .field("input_rate", &self.input_rate)
            .field("input_channels", &self.input_channels)
            .field("passthrough", &self.state.is_none())
            .field(
                "buffered",
                &self.state.as_ref().map_or(0, |s| s.internal_mono_buffer.len()),
            )
            .finish()
    }
}

impl SampleRateAdapter {
    pub fn new(input_rate: u32, input_channels: u16) -> Result<Self, BridgeError> {
        if input_rate == 0 || input_channels == 0 {
            return Err(BridgeError::AudioResamplingError(format!(
                "invalid input format {}Hz {}ch",
                input_rate, input_channels
            )));
        }

        let state = if input_rate == SERVICE_SAMPLE_RATE_HZ {
            None
        } else {
            info!(
                "[Adapter] Resampling {}Hz {}ch -> {}Hz {}ch.",
                input_rate, input_channels, SERVICE_SAMPLE_RATE_HZ, SERVICE_AUDIO_CHANNELS
            );
            let resampler = Fft::<f32>::new(
                input_rate as usize,
                SERVICE_SAMPLE_RATE_HZ as usize,
                RESAMPLER_CHUNK_FRAMES,
                RESAMPLER_SUB_CHUNKS,
                SERVICE_AUDIO_CHANNELS as usize,
                FixedSync::Input,
            )
            .map_err(|e| {
                BridgeError::AudioResamplingError(format!("Failed to create Fft resampler: {}", e))
            })?;
            let max_output_frames = resampler.output_frames_max();
            Some(ResamplerState {
                resampler,
                internal_mono_buffer: Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2),
                output_buffer_alloc: vec![
                    vec![0.0f32; max_output_frames.max(1)];
                    SERVICE_AUDIO_CHANNELS as usize
                ],
            })
        };

        Ok(Self {
            input_rate,
            input_channels,
            state,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.state.is_none() && self.input_channels == 1
    }

    /// Mono samples waiting for a full resampler block.
    pub fn buffered(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |s| s.internal_mono_buffer.len())
    }

    /// Drops buffered input without touching the resampler's filter state.
    pub fn discard_buffered(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.internal_mono_buffer.clear();
        }
    }

    /// Converts one interleaved device chunk.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, BridgeError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_passthrough() {
            return Ok(samples.to_vec());
        }

        let mono = downmix(samples, self.input_channels);
        let Some(state) = self.state.as_mut() else {
            // Rates already match; only the channel count differed.
            return Ok(mono.iter().map(|&s| f32_to_i16(s)).collect());
        };

        state.internal_mono_buffer.extend(mono);
        trace!(
            "[Adapter] Buffered mono samples: {}.",
            state.internal_mono_buffer.len()
        );
        Self::drain_full_blocks(state)
    }

    fn drain_full_blocks(state: &mut ResamplerState) -> Result<Vec<i16>, BridgeError> {
        let mut out = Vec::new();
        loop {
            let required_input_frames = state.resampler.input_frames_next();
            if state.internal_mono_buffer.len() < required_input_frames || required_input_frames == 0
            {
                break;
            }

            let chunk: Vec<f32> = state
                .internal_mono_buffer
                .drain(..required_input_frames)
                .collect();
            let input_for_adapter = vec![chunk];
            let input_adapter = SequentialSliceOfVecs::new(
                &input_for_adapter,
                SERVICE_AUDIO_CHANNELS as usize,
                required_input_frames,
            )
            .map_err(|e| BridgeError::AudioResamplingError(format!("Input adapter error: {}", e)))?;

            let output_frames_next = state.resampler.output_frames_next();
            state.output_buffer_alloc[0].resize(output_frames_next.max(1), 0.0);
            let mut output_adapter = SequentialSliceOfVecs::new_mut(
                &mut state.output_buffer_alloc,
                SERVICE_AUDIO_CHANNELS as usize,
                output_frames_next.max(1),
            )
            .map_err(|e| {
                BridgeError::AudioResamplingError(format!("Output adapter error: {}", e))
            })?;

            let (_consumed, produced) = state
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| BridgeError::AudioResamplingError(e.to_string()))?;

            out.extend(
                state.output_buffer_alloc[0][..produced]
                    .iter()
                    .map(|&s| f32_to_i16(s)),
            );
        }
        if !out.is_empty() {
            debug!("[Adapter] Produced {} samples.", out.len());
        }
        Ok(out)
    }
}

fn downmix(samples: &[i16], channels: u16) -> Vec<f32> {
    let channels = channels as usize;
    if channels == 1 {
        return samples.iter().map(|&s| i16_to_f32(s)).collect();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| i16_to_f32(s)).sum::<f32>() / channels as f32)
        .collect()
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / (i16::MAX as f32 + 1.0)
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample * (i16::MAX as f32 + 1.0))
        .clamp(i16::MIN as f32, i16::MAX as f32)
        .round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_mono(num_frames: usize, sample_rate: u32, frequency: f32) -> Vec<i16> {
        (0..num_frames)
            .map(|i| {
                let time = i as f32 / sample_rate as f32;
                let value = (2.0 * std::f32::consts::PI * frequency * time).sin();
                (value * (i16::MAX as f32 * 0.8)) as i16
            })
            .collect()
    }

    #[test]
    fn equal_rate_mono_is_passthrough() {
        let mut adapter = SampleRateAdapter::new(24_000, 1).unwrap();
        assert!(adapter.is_passthrough());
        let input = sine_mono(480, 24_000, 440.0);
        assert_eq!(adapter.process(&input).unwrap(), input);
    }

    #[test]
    fn equal_rate_stereo_is_only_downmixed() {
        let mut adapter = SampleRateAdapter::new(24_000, 2).unwrap();
        assert!(!adapter.is_passthrough());
        let out = adapter.process(&[100, 300, -200, -400]).unwrap();
        assert_eq!(out, vec![200, -300]);
    }

    #[test]
    fn downsampling_48k_halves_sample_count_over_time() {
        let mut adapter = SampleRateAdapter::new(48_000, 1).unwrap();
        let input = sine_mono(48_000, 48_000, 440.0);
        let mut produced = 0;
        for chunk in input.chunks(960) {
            produced += adapter.process(chunk).unwrap().len();
        }
        // One second in, minus what is still buffered or in the filter delay.
        assert!(produced > 22_000 && produced <= 24_000, "produced {}", produced);
        assert!(adapter.buffered() < RESAMPLER_CHUNK_FRAMES);
    }

    #[test]
    fn stereo_input_is_mixed_before_resampling() {
        let mut adapter = SampleRateAdapter::new(48_000, 2).unwrap();
        let stereo: Vec<i16> = sine_mono(4096, 48_000, 440.0)
            .into_iter()
            .flat_map(|s| [s, s])
            .collect();
        let out = adapter.process(&stereo).unwrap();
        assert!(!out.is_empty());
        assert!(out.len() <= 2048);
    }

    #[test]
    fn small_chunks_accumulate_until_a_block_is_ready() {
        let mut adapter = SampleRateAdapter::new(44_100, 1).unwrap();
        let first = adapter.process(&vec![0i16; 100]).unwrap();
        assert!(first.is_empty());
        assert_eq!(adapter.buffered(), 100);
        adapter.discard_buffered();
        assert_eq!(adapter.buffered(), 0);
    }

    #[test]
    fn invalid_format_is_rejected() {
        assert!(matches!(
            SampleRateAdapter::new(0, 1),
            Err(BridgeError::AudioResamplingError(_))
        ));
        assert!(SampleRateAdapter::new(16_000, 0).is_err());
    }
}
