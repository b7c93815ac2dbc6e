//! Opus encoder wrapper
//!
//! Used by the native client to produce the same voice stream a browser
//! recorder would send.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::decoder::OPUS_SAMPLE_RATES;
use crate::error::CodecError;

/// Mono voice encoder
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    frame_duration_ms: u32,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create an encoder tuned for speech
    pub fn voice(sample_rate: u32, frame_duration_ms: u32, bitrate: u32) -> Result<Self, CodecError> {
        if !OPUS_SAMPLE_RATES.contains(&sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(sample_rate));
        }
        if ![10, 20, 40, 60].contains(&frame_duration_ms) {
            return Err(CodecError::EncoderInit(format!(
                "Unsupported frame duration: {} ms",
                frame_duration_ms
            )));
        }

        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_signal(opus::Signal::Voice)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set signal type: {}", e)))?;

        // Pre-allocate encoding buffer (max Opus frame is about 1275 bytes)
        let encode_buffer = vec![0u8; 4000];

        Ok(Self {
            encoder,
            sample_rate,
            frame_duration_ms,
            encode_buffer,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode exactly one frame of mono f32 samples
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.frame_size() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Samples per frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000) as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
