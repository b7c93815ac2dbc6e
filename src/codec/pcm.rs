//! Linear PCM chunks
//!
//! Mono signed 16-bit samples. The wire form is little-endian bytes in both
//! directions of the relay.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::constants::PCM_FULL_SCALE;
use crate::error::PlaybackError;

/// Immutable block of mono i16 samples at a fixed rate
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Parse little-endian bytes. Odd lengths are rejected.
    pub fn from_le_bytes(data: &[u8], sample_rate: u32) -> Result<Self, PlaybackError> {
        if data.len() % 2 != 0 {
            return Err(PlaybackError::OddByteLength(data.len()));
        }
        let samples = data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        Ok(Self::new(samples, sample_rate))
    }

    /// Encode as little-endian bytes
    pub fn to_le_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.samples.len() * 2);
        for &s in self.samples.iter() {
            out.put_i16_le(s);
        }
        out.freeze()
    }

    /// Normalize to f32 in [-1.0, 1.0)
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / PCM_FULL_SCALE).collect()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playout duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_bytes() {
        let chunk = PcmChunk::new(vec![1, -2, i16::MAX, i16::MIN], 16000);
        let bytes = chunk.to_le_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(PcmChunk::from_le_bytes(&bytes, 16000).unwrap(), chunk);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert_eq!(
            PcmChunk::from_le_bytes(&[1, 2, 3], 24000),
            Err(PlaybackError::OddByteLength(3))
        );
    }

    #[test]
    fn test_normalization() {
        let chunk = PcmChunk::new(vec![0, i16::MIN, 16384], 24000);
        assert_eq!(chunk.to_f32(), vec![0.0, -1.0, 0.5]);
    }

    #[test]
    fn test_duration() {
        let chunk = PcmChunk::new(vec![0; 2400], 24000);
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-12);
    }
}
