//! Streaming sample rate conversion for devices that cannot run at the stream rate.
//!
//! Uses Rubato's asynchronous sinc resampler on interleaved `f32` audio. Input is collected
//! into fixed-size chunks; whatever does not fill a chunk waits for the next call or for
//! [`StreamResampler::finish`].

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::DeviceError;

pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    ratio: f64,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    pub fn new(
        src_rate: u32,
        dst_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self, DeviceError> {
        let ratio = dst_rate as f64 / src_rate.max(1) as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let channels = channels.max(1);
        let resampler =
            Async::<f32>::new_sinc(ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
                .map_err(|e| DeviceError::Backend(format!("resampler init: {e}")))?;

        tracing::debug!(src_rate, dst_rate, channels, chunk_frames, "resampler ready");
        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            chunk_frames,
            ratio,
            pending: Vec::with_capacity(chunk_frames * channels),
            scratch: vec![0.0; channels * (chunk_frames as f64 * ratio * 1.5) as usize + channels * 16],
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Input frames waiting for a full chunk.
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    /// Resample `input` and append the produced samples to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), DeviceError> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut start = 0;
        while self.pending.len() - start >= chunk_samples {
            let chunk = self.pending[start..start + chunk_samples].to_vec();
            self.run(&chunk, None, out)?;
            start += chunk_samples;
        }
        self.pending.drain(..start);
        Ok(())
    }

    /// Push the partial chunk through so the end of a stream is not lost.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> Result<(), DeviceError> {
        let frames = self.pending_frames();
        if frames == 0 {
            return Ok(());
        }
        let mut tail = std::mem::take(&mut self.pending);
        tail.resize(self.chunk_frames * self.channels, 0.0);
        self.run(&tail, Some(frames), out)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }

    fn run(&mut self, chunk: &[f32], partial: Option<usize>, out: &mut Vec<f32>) -> Result<(), DeviceError> {
        let input = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
            .map_err(|e| DeviceError::Backend(format!("interleaved slice (input): {e}")))?;
        let capacity_frames = self.scratch.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.scratch, self.channels, capacity_frames)
            .map_err(|e| DeviceError::Backend(format!("interleaved slice (output): {e}")))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        let (_consumed, produced) = self
            .resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| DeviceError::Backend(format!("resampler process: {e}")))?;
        out.extend_from_slice(&self.scratch[..produced * self.channels]);
        Ok(())
    }
}
