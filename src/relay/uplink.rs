//! Uplink relay
//!
//! Encodes decoded PCM for the remote session and queues it without ever
//! blocking the inbound path. The queue is bounded: when the remote side
//! falls behind, new chunks are dropped and counted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::codec::PcmChunk;
use crate::error::SessionError;
use crate::session::AudioPayload;

/// What happened to a submitted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full; the chunk was discarded
    Dropped,
}

/// Ordered, bounded submission of PCM chunks to a remote session
pub struct UplinkRelay {
    tx: mpsc::Sender<AudioPayload>,
    mime_type: String,
    chunks_queued: u64,
    chunks_dropped: u64,
    bytes_queued: u64,
}

impl UplinkRelay {
    pub fn new(tx: mpsc::Sender<AudioPayload>, mime_type: impl Into<String>) -> Self {
        Self {
            tx,
            mime_type: mime_type.into(),
            chunks_queued: 0,
            chunks_dropped: 0,
            bytes_queued: 0,
        }
    }

    /// Base64 of the chunk's little-endian samples
    pub fn encode(&self, chunk: &PcmChunk) -> AudioPayload {
        AudioPayload {
            data: BASE64.encode(chunk.to_le_bytes()),
            mime_type: self.mime_type.clone(),
        }
    }

    /// Queue a chunk. Fails only once the remote session is gone.
    pub fn submit(&mut self, chunk: &PcmChunk) -> Result<SubmitOutcome, SessionError> {
        let payload = self.encode(chunk);
        let len = payload.data.len() as u64;

        match self.tx.try_send(payload) {
            Ok(()) => {
                self.chunks_queued += 1;
                self.bytes_queued += len;
                Ok(SubmitOutcome::Queued)
            }
            Err(TrySendError::Full(_)) => {
                self.chunks_dropped += 1;
                if self.chunks_dropped == 1 || self.chunks_dropped % 50 == 0 {
                    tracing::warn!(
                        "Remote session is not keeping up, {} chunks dropped so far",
                        self.chunks_dropped
                    );
                }
                Ok(SubmitOutcome::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> UplinkStats {
        UplinkStats {
            chunks_queued: self.chunks_queued,
            chunks_dropped: self.chunks_dropped,
            bytes_queued: self.bytes_queued,
        }
    }
}

/// Uplink statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
    /// Encoded (base64) bytes
    pub bytes_queued: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        let (tx, _rx) = mpsc::channel(1);
        let relay = UplinkRelay::new(tx, "audio/pcm;rate=16000");
        let payload = relay.encode(&PcmChunk::new(vec![1, 256], 16000));
        assert_eq!(payload.data, "AQAAAQ==");
        assert_eq!(payload.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_order_is_preserved() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut relay = UplinkRelay::new(tx, "audio/pcm;rate=16000");

        let chunks: Vec<PcmChunk> = (0..10).map(|i| PcmChunk::new(vec![i; 4], 16000)).collect();
        for chunk in &chunks {
            assert_eq!(relay.submit(chunk).unwrap(), SubmitOutcome::Queued);
        }

        for chunk in &chunks {
            assert_eq!(rx.try_recv().unwrap(), relay.encode(chunk));
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut relay = UplinkRelay::new(tx, "audio/pcm;rate=16000");
        let chunk = PcmChunk::new(vec![0; 320], 16000);

        assert_eq!(relay.submit(&chunk).unwrap(), SubmitOutcome::Queued);
        assert_eq!(relay.submit(&chunk).unwrap(), SubmitOutcome::Queued);
        assert_eq!(relay.submit(&chunk).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(relay.stats().chunks_dropped, 1);

        rx.try_recv().unwrap();
        assert_eq!(relay.submit(&chunk).unwrap(), SubmitOutcome::Queued);
    }

    #[test]
    fn test_closed_session_is_an_error() {
        let (tx, rx) = mpsc::channel(2);
        let mut relay = UplinkRelay::new(tx, "audio/pcm;rate=16000");
        drop(rx);

        assert!(matches!(
            relay.submit(&PcmChunk::new(vec![0; 4], 16000)),
            Err(SessionError::Closed)
        ));
    }
}
