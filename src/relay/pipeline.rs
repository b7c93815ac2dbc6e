//! Inbound audio pipeline
//!
//! Per-connection chain from raw container fragments to queued uplink
//! audio:
//!
//! ```text
//! fragment ──► WebmDemuxer ──► Block::parse ──► FrameDecoder ──► UplinkRelay
//!              (elements)      (frames)         (PcmChunk)       (base64)
//! ```
//!
//! Container errors are fatal for the stream. A frame the codec rejects is
//! skipped and the stream carries on.

use crate::codec::{FrameDecoder, OpusFrameDecoder};
use crate::container::{Block, WebmDemuxer};
use crate::error::Result;
use crate::relay::uplink::{SubmitOutcome, UplinkRelay, UplinkStats};

/// Outcome of one inbound fragment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub elements: usize,
    pub frames: usize,
    pub decoded: usize,
    /// Frames the codec rejected
    pub skipped: usize,
    /// Decoded chunks dropped on a full uplink queue
    pub dropped: usize,
}

/// Cumulative pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub fragments: u64,
    pub bytes_in: u64,
    pub blocks: u64,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub uplink: UplinkStats,
}

/// Demux, decode and relay for one client stream
pub struct InboundPipeline<D: FrameDecoder = OpusFrameDecoder> {
    demuxer: WebmDemuxer,
    decoder: D,
    uplink: UplinkRelay,
    stats: PipelineStats,
}

impl<D: FrameDecoder> InboundPipeline<D> {
    pub fn new(demuxer: WebmDemuxer, decoder: D, uplink: UplinkRelay) -> Self {
        Self {
            demuxer,
            decoder,
            uplink,
            stats: PipelineStats::default(),
        }
    }

    /// Process one transport message.
    ///
    /// Fails on a malformed container or once the remote session is gone;
    /// either way the connection should be torn down.
    pub fn on_inbound(&mut self, data: &[u8]) -> Result<FeedReport> {
        self.stats.fragments += 1;
        self.stats.bytes_in += data.len() as u64;

        let elements = self.demuxer.feed(data)?;
        let mut report = FeedReport {
            elements: elements.len(),
            ..Default::default()
        };

        for element in elements.iter().filter(|e| e.is_block()) {
            let block = Block::parse(&element.data)?;
            self.stats.blocks += 1;

            for frame in &block.frames {
                report.frames += 1;
                match self.decoder.decode(frame) {
                    Ok(pcm) => {
                        report.decoded += 1;
                        if self.uplink.submit(&pcm)? == SubmitOutcome::Dropped {
                            report.dropped += 1;
                        }
                    }
                    Err(e) => {
                        report.skipped += 1;
                        tracing::warn!("Skipping undecodable frame ({} bytes): {}", frame.len(), e);
                    }
                }
            }
        }

        self.stats.frames_decoded += report.decoded as u64;
        self.stats.frames_skipped += report.skipped as u64;
        Ok(report)
    }

    /// Get statistics
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            uplink: self.uplink.stats(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OpusEncoder, PcmChunk};
    use crate::container::WebmWriter;
    use crate::error::{CodecError, ContainerError, Error, SessionError};
    use crate::session::AudioPayload;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use tokio::sync::mpsc;

    const MIME: &str = "audio/pcm;rate=16000";

    fn pipeline(depth: usize) -> (InboundPipeline, mpsc::Receiver<AudioPayload>) {
        let (tx, rx) = mpsc::channel(depth);
        let pipeline = InboundPipeline::new(
            WebmDemuxer::new(),
            OpusFrameDecoder::new(16000).unwrap(),
            UplinkRelay::new(tx, MIME),
        );
        (pipeline, rx)
    }

    fn tone_frame(encoder: &mut OpusEncoder, phase: usize) -> bytes::Bytes {
        let samples: Vec<f32> = (0..encoder.frame_size())
            .map(|i| ((i + phase) as f32 * 0.05).sin() * 0.3)
            .collect();
        encoder.encode(&samples).unwrap()
    }

    #[test]
    fn test_valid_then_corrupt_block() {
        let mut encoder = OpusEncoder::voice(16000, 20, 32_000).unwrap();
        let mut writer = WebmWriter::new(16000, 1, 20);
        writer.write_frame(&tone_frame(&mut encoder, 0));
        let first = writer.take_fragment();

        writer.write_frame(&[0xFF, 0xFF]);
        let second = writer.take_fragment();

        let (mut pipeline, mut rx) = pipeline(8);

        let report = pipeline.on_inbound(&first).unwrap();
        assert_eq!(report.decoded, 1);
        assert_eq!(report.skipped, 0);

        let report = pipeline.on_inbound(&second).unwrap();
        assert_eq!(report.decoded, 0);
        assert_eq!(report.skipped, 1);

        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.mime_type, MIME);
        let pcm = PcmChunk::from_le_bytes(&BASE64.decode(payload.data).unwrap(), 16000).unwrap();
        assert_eq!(pcm.len(), 320);
        assert!(rx.try_recv().is_err());

        let stats = pipeline.stats();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.uplink.chunks_queued, 1);
    }

    #[test]
    fn test_fragment_boundaries_do_not_matter() {
        let mut encoder = OpusEncoder::voice(16000, 20, 32_000).unwrap();
        let mut writer = WebmWriter::new(16000, 1, 20);
        for i in 0..6 {
            writer.write_frame(&tone_frame(&mut encoder, i * 320));
        }
        let stream = writer.take_fragment();

        let (mut pipeline, mut rx) = pipeline(16);
        let mut decoded = 0;
        for piece in stream.chunks(7) {
            decoded += pipeline.on_inbound(piece).unwrap().decoded;
        }

        assert_eq!(decoded, 6);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 6);
    }

    #[test]
    fn test_malformed_container_is_fatal() {
        let (mut pipeline, _rx) = pipeline(8);
        let err = pipeline.on_inbound(&[0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Container(ContainerError::InvalidElementId { .. })));

        // The demuxer stays poisoned
        assert!(pipeline.on_inbound(&[0x1A]).is_err());
    }

    #[test]
    fn test_closed_session_is_fatal() {
        let mut encoder = OpusEncoder::voice(16000, 20, 32_000).unwrap();
        let mut writer = WebmWriter::new(16000, 1, 20);
        writer.write_frame(&tone_frame(&mut encoder, 0));

        let (mut pipeline, rx) = pipeline(8);
        drop(rx);

        let err = pipeline.on_inbound(&writer.take_fragment()).unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Closed)));
    }

    struct RejectingDecoder;

    impl FrameDecoder for RejectingDecoder {
        fn decode(&mut self, _payload: &[u8]) -> std::result::Result<PcmChunk, CodecError> {
            Err(CodecError::DecodingFailed("rejected".into()))
        }

        fn sample_rate(&self) -> u32 {
            16000
        }
    }

    #[test]
    fn test_undecodable_frames_never_reach_uplink() {
        let mut writer = WebmWriter::new(16000, 1, 20);
        writer.write_frame(&[1, 2, 3]);
        writer.write_frame(&[4, 5, 6]);

        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline =
            InboundPipeline::new(WebmDemuxer::new(), RejectingDecoder, UplinkRelay::new(tx, MIME));

        let report = pipeline.on_inbound(&writer.take_fragment()).unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.skipped, 2);
        assert!(rx.try_recv().is_err());
    }
}
