//! Voice recorder
//!
//! Turns a stream of mono microphone samples into timesliced fragments of
//! one continuous WebM/Opus stream, the same shape a browser recorder
//! sends. The first fragment carries the stream header.

use bytes::Bytes;

use crate::codec::OpusEncoder;
use crate::container::WebmWriter;
use crate::error::CodecError;

/// Opus encoder plus WebM muxer with timeslice output
pub struct Recorder {
    encoder: OpusEncoder,
    writer: WebmWriter,
    /// Samples waiting for a full frame
    pending: Vec<f32>,
    frames_per_fragment: u64,
    frames_in_fragment: u64,
    fragments: u64,
}

impl Recorder {
    pub fn new(
        sample_rate: u32,
        frame_duration_ms: u32,
        bitrate: u32,
        timeslice_ms: u64,
    ) -> Result<Self, CodecError> {
        let encoder = OpusEncoder::voice(sample_rate, frame_duration_ms, bitrate)?;
        let writer = WebmWriter::new(sample_rate, 1, frame_duration_ms as u64);
        let frames_per_fragment = (timeslice_ms / frame_duration_ms as u64).max(1);

        Ok(Self {
            pending: Vec::with_capacity(encoder.frame_size() * 2),
            encoder,
            writer,
            frames_per_fragment,
            frames_in_fragment: 0,
            fragments: 0,
        })
    }

    /// Add captured samples; returns every fragment completed by them
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, CodecError> {
        self.pending.extend_from_slice(samples);

        let frame_size = self.encoder.frame_size();
        let mut fragments = Vec::new();
        let mut consumed = 0;

        while self.pending.len() - consumed >= frame_size {
            let frame = self.encoder.encode(&self.pending[consumed..consumed + frame_size])?;
            consumed += frame_size;
            self.writer.write_frame(&frame);
            self.frames_in_fragment += 1;

            if self.frames_in_fragment >= self.frames_per_fragment {
                fragments.push(self.take());
            }
        }

        self.pending.drain(..consumed);
        Ok(fragments)
    }

    /// Encode the partial frame padded with silence and return whatever
    /// has not been handed out yet
    pub fn finish(&mut self) -> Result<Option<Bytes>, CodecError> {
        if !self.pending.is_empty() {
            let mut frame = std::mem::take(&mut self.pending);
            frame.resize(self.encoder.frame_size(), 0.0);
            let packet = self.encoder.encode(&frame)?;
            self.writer.write_frame(&packet);
            self.frames_in_fragment += 1;
        }

        if self.writer.pending() == 0 {
            return Ok(None);
        }
        Ok(Some(self.take()))
    }

    fn take(&mut self) -> Bytes {
        self.frames_in_fragment = 0;
        self.fragments += 1;
        self.writer.take_fragment()
    }

    pub fn frames_written(&self) -> u64 {
        self.writer.frames_written()
    }

    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    /// Samples per encoded frame
    pub fn frame_size(&self) -> usize {
        self.encoder.frame_size()
    }
}
