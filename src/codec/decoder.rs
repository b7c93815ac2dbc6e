//! Opus frame decoder
//!
//! One decoder per connection: libopus keeps prediction state between
//! frames, so an instance must never be shared across streams.

use opus::{Channels, Decoder};

use crate::codec::pcm::PcmChunk;
use crate::constants::MAX_OPUS_FRAME_MS;
use crate::error::CodecError;

/// Sample rates libopus can decode to
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Converts one coded frame into a PCM chunk
pub trait FrameDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<PcmChunk, CodecError>;

    /// Output sample rate
    fn sample_rate(&self) -> u32;
}

/// Mono Opus decoder producing i16 PCM
pub struct OpusFrameDecoder {
    decoder: Decoder,
    sample_rate: u32,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames rejected by the codec
    frames_failed: u64,
    /// Total samples produced
    samples_produced: u64,
}

impl OpusFrameDecoder {
    /// Create a new mono decoder
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        if !OPUS_SAMPLE_RATES.contains(&sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(sample_rate));
        }

        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // Largest Opus packet is 120ms
        let decode_buffer = vec![0i16; (sample_rate * MAX_OPUS_FRAME_MS / 1000) as usize];

        Ok(Self {
            decoder,
            sample_rate,
            decode_buffer,
            frames_decoded: 0,
            frames_failed: 0,
            samples_produced: 0,
        })
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_failed: self.frames_failed,
            samples_produced: self.samples_produced,
        }
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<PcmChunk, CodecError> {
        // An empty packet would make libopus run loss concealment instead.
        if payload.is_empty() {
            self.frames_failed += 1;
            return Err(CodecError::EmptyFrame);
        }

        let samples = match self.decoder.decode(payload, &mut self.decode_buffer, false) {
            Ok(samples) => samples,
            Err(e) => {
                self.frames_failed += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        self.frames_decoded += 1;
        self.samples_produced += samples as u64;

        Ok(PcmChunk::new(
            self.decode_buffer[..samples].to_vec(),
            self.sample_rate,
        ))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_failed: u64,
    pub samples_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusEncoder;

    /// Two 20ms voice frames of a 440 Hz tone at 48 kHz
    fn encoded_tone() -> Vec<bytes::Bytes> {
        let mut encoder = OpusEncoder::voice(48000, 20, 32_000).unwrap();
        let frame_size = encoder.frame_size();
        (0..2)
            .map(|n| {
                let samples: Vec<f32> = (0..frame_size)
                    .map(|i| {
                        let t = (n * frame_size + i) as f32 / 48000.0;
                        (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5
                    })
                    .collect();
                encoder.encode(&samples).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_decoder_creation() {
        assert!(OpusFrameDecoder::new(16000).is_ok());
        assert!(matches!(
            OpusFrameDecoder::new(44100),
            Err(CodecError::UnsupportedSampleRate(44100))
        ));
    }

    #[test]
    fn test_decode_resamples_to_output_rate() {
        let frames = encoded_tone();
        let mut decoder = OpusFrameDecoder::new(16000).unwrap();

        let pcm = decoder.decode(&frames[0]).unwrap();
        // 20ms at 16 kHz
        assert_eq!(pcm.len(), 320);
        assert_eq!(pcm.sample_rate(), 16000);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_decode_is_deterministic_across_fresh_decoders() {
        let frames = encoded_tone();
        let mut first = OpusFrameDecoder::new(16000).unwrap();
        let mut second = OpusFrameDecoder::new(16000).unwrap();

        for frame in &frames {
            assert_eq!(first.decode(frame).unwrap(), second.decode(frame).unwrap());
        }
    }

    #[test]
    fn test_corrupt_frame_is_reported_and_decoder_survives() {
        let frames = encoded_tone();
        let mut decoder = OpusFrameDecoder::new(16000).unwrap();

        // Code 3 packet claiming 63 frames of 20ms: longer than 120ms
        assert!(matches!(
            decoder.decode(&[0xFF, 0xFF]),
            Err(CodecError::DecodingFailed(_))
        ));
        assert!(matches!(decoder.decode(&[]), Err(CodecError::EmptyFrame)));
        assert!(decoder.decode(&frames[0]).is_ok());

        let stats = decoder.stats();
        assert_eq!(stats.frames_failed, 2);
        assert_eq!(stats.frames_decoded, 1);
    }
}
