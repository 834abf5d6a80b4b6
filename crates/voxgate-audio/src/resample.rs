//! Format conversion from decoded audio to the output device layout.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;
use voxgate_core::{Error, Result};

const CHUNK_FRAMES: usize = 1024;

/// Sample-rate converter for interleaved audio.
///
/// Passes samples through untouched when the rates already match.
pub struct Resampler {
    inner: Option<FftFixedIn<f32>>,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let inner = if input_rate == output_rate {
            None
        } else {
            debug!(
                "Resampling {}Hz -> {}Hz, {} channels",
                input_rate, output_rate, channels
            );
            Some(
                FftFixedIn::new(
                    input_rate as usize,
                    output_rate as usize,
                    CHUNK_FRAMES,
                    2,
                    channels,
                )
                .map_err(|e| Error::AudioDecode(format!("Failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            pending: vec![Vec::new(); channels],
        })
    }

    pub const fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Convert interleaved input; may return fewer samples until a full chunk is buffered.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        for frame in input.chunks_exact(self.channels) {
            for (channel, &sample) in self.pending.iter_mut().zip(frame) {
                channel.push(sample);
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|e| Error::AudioDecode(format!("Resample failed: {e}")))?;
            interleave_into(&resampled, &mut output);
        }
        Ok(output)
    }

    /// Convert whatever is still buffered at end of stream.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending[0].is_empty() {
            return Ok(Vec::new());
        }

        let chunk: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        let resampled = resampler
            .process_partial(Some(chunk.as_slice()), None)
            .map_err(|e| Error::AudioDecode(format!("Resample flush failed: {e}")))?;
        let mut output = Vec::new();
        interleave_into(&resampled, &mut output);
        Ok(output)
    }
}

fn interleave_into(planes: &[Vec<f32>], output: &mut Vec<f32>) {
    let Some(frames) = planes.first().map(Vec::len) else {
        return;
    };
    output.reserve(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            output.push(plane[frame]);
        }
    }
}

/// Map interleaved audio from one channel count to another.
///
/// Mono is duplicated across outputs; down-mixing to mono averages; other
/// layouts copy channels round-robin.
pub fn remix(input: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return input.to_vec();
    }

    let frames = input.len() / from;
    let mut output = Vec::with_capacity(frames * to);
    for frame in input.chunks_exact(from) {
        if to == 1 {
            output.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for channel in 0..to {
                output.push(frame[channel % from]);
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let mut resampler = Resampler::new(48000, 48000, 2).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.1, 0.2]).unwrap(), vec![0.1, 0.2]);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_upsample_length() {
        let mut resampler = Resampler::new(24000, 48000, 1).unwrap();
        let mut out = resampler.process(&vec![0.0f32; 4096]).unwrap();
        out.extend(resampler.flush().unwrap());
        // Roughly doubled, allowing for filter delay
        assert!(out.len() > 6000, "got {}", out.len());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_remix() {
        assert_eq!(remix(&[0.5, 0.25], 1, 2), vec![0.5, 0.5, 0.25, 0.25]);
        assert_eq!(remix(&[1.0, 0.0, 0.5, 0.5], 2, 1), vec![0.5, 0.5]);
        assert_eq!(remix(&[1.0, 2.0], 2, 2), vec![1.0, 2.0]);
    }
}
