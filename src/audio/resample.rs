//! Streaming sample-rate conversion
//!
//! Wraps a rubato FFT resampler for mono audio fed in arbitrary block
//! sizes. Input is buffered until a full resampler chunk is available and
//! the filter delay is dropped from the front of the output, so output
//! sample `k` lines up with input time `k / to_rate`.

use rubato::{FftFixedIn, Resampler};

use crate::error::AudioError;

/// Sub-chunks per FFT chunk
const SUB_CHUNKS: usize = 2;

/// Mono streaming resampler; passes input through when the rates match
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    fft: Option<FftFixedIn<f32>>,
    /// Input waiting for a full chunk
    pending: Vec<f32>,
    /// Output frames still to discard for the filter delay
    skip: usize,
    /// Input frames accepted since the last reset
    consumed: u64,
    /// Output frames emitted since the last reset
    produced: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, AudioError> {
        let fft = if from_rate == to_rate {
            None
        } else {
            // 10 ms chunks
            let chunk = (from_rate as usize / 100).max(64);
            let fft = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk, SUB_CHUNKS, 1)
                .map_err(|e| {
                    AudioError::UnsupportedFormat(format!(
                        "cannot resample {} Hz to {} Hz: {}",
                        from_rate, to_rate, e
                    ))
                })?;
            Some(fft)
        };

        let skip = fft.as_ref().map_or(0, |f| f.output_delay());
        Ok(Self {
            from_rate,
            to_rate,
            fft,
            pending: Vec::new(),
            skip,
            consumed: 0,
            produced: 0,
        })
    }

    /// Whether input passes through unchanged
    pub fn is_passthrough(&self) -> bool {
        self.fft.is_none()
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Output frames the input accepted so far corresponds to
    pub fn expected_output_len(&self) -> u64 {
        if self.is_passthrough() {
            return self.consumed;
        }
        (self.consumed as u128 * self.to_rate as u128 / self.from_rate as u128) as u64
    }

    /// Resample one block, appending whatever is ready to `out`
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), AudioError> {
        self.consumed += input.len() as u64;
        if self.fft.is_none() {
            out.extend_from_slice(input);
            self.produced += input.len() as u64;
            return Ok(());
        }

        self.pending.extend_from_slice(input);
        while self.pending.len() >= self.chunk_len() {
            self.run_chunk(out)?;
        }
        Ok(())
    }

    /// Resample one block
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        let mut out = Vec::with_capacity(self.output_len_hint(input.len()));
        self.process_into(input, &mut out)?;
        Ok(out)
    }

    /// Push out everything still buffered, padding with silence, so the
    /// total output matches the input accepted since the last reset
    pub fn flush_into(&mut self, out: &mut Vec<f32>) -> Result<(), AudioError> {
        if self.fft.is_none() {
            return Ok(());
        }

        let expected = self.expected_output_len();
        let start = out.len();
        let keep = expected.saturating_sub(self.produced) as usize;
        while self.produced < expected {
            let chunk = self.chunk_len();
            if self.pending.len() < chunk {
                self.pending.resize(chunk, 0.0);
            }
            self.run_chunk(out)?;
        }

        // Drop the padding beyond the real input
        out.truncate(start + keep);
        self.reset();
        Ok(())
    }

    /// Approximate output length for `input_len` samples
    pub fn output_len_hint(&self, input_len: usize) -> usize {
        (input_len as u64 * self.to_rate as u64 / self.from_rate.max(1) as u64) as usize + self.chunk_len()
    }

    /// Forget buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.consumed = 0;
        self.produced = 0;
        if let Some(fft) = self.fft.as_mut() {
            fft.reset();
            self.skip = fft.output_delay();
        }
    }

    fn chunk_len(&self) -> usize {
        self.fft.as_ref().map_or(0, |f| f.input_frames_next())
    }

    /// Resample one full chunk from `pending`
    fn run_chunk(&mut self, out: &mut Vec<f32>) -> Result<(), AudioError> {
        let Some(fft) = self.fft.as_mut() else {
            return Ok(());
        };
        let need = fft.input_frames_next();
        let resampled = fft
            .process(&[&self.pending[..need]], None)
            .map_err(|e| AudioError::StreamError(format!("resampling failed: {}", e)))?;
        self.pending.drain(..need);

        let frames = resampled.first().map(Vec::as_slice).unwrap_or(&[]);
        let dropped = self.skip.min(frames.len());
        self.skip -= dropped;
        out.extend_from_slice(&frames[dropped..]);
        self.produced += (frames.len() - dropped) as u64;
        Ok(())
    }
}

/// Average interleaved frames down to mono
pub fn downmix_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}
