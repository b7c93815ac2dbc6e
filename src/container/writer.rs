//! Live WebM writer
//!
//! Produces the same shape of stream a browser recorder emits for an
//! audio-only Opus capture: a known-size EBML header, an unknown-size
//! `Segment`, track metadata, then unknown-size clusters of `SimpleBlock`s.

use bytes::Bytes;

use crate::container::ebml::{self, ElementId};

/// Track number used for the single audio track
pub const AUDIO_TRACK: u64 = 1;

/// Opus pre-skip recommended by RFC 7845 for 48 kHz
const OPUS_PRE_SKIP: u16 = 312;

/// Streaming WebM/Opus muxer
pub struct WebmWriter {
    out: Vec<u8>,
    frame_duration_ms: u64,
    /// Timestamp of the next frame in milliseconds
    timestamp_ms: u64,
    /// Timestamp of the open cluster, if any
    cluster_ms: Option<u64>,
    frames_written: u64,
}

impl WebmWriter {
    /// Create a writer and emit the stream header
    pub fn new(sample_rate: u32, channels: u8, frame_duration_ms: u64) -> Self {
        let mut writer = Self {
            out: Vec::with_capacity(4096),
            frame_duration_ms,
            timestamp_ms: 0,
            cluster_ms: None,
            frames_written: 0,
        };
        writer.write_header(sample_rate, channels);
        writer
    }

    fn write_header(&mut self, sample_rate: u32, channels: u8) {
        let mut ebml_header = Vec::new();
        uint_element(&mut ebml_header, ElementId::EBML_VERSION, 1);
        uint_element(&mut ebml_header, ElementId::EBML_READ_VERSION, 1);
        uint_element(&mut ebml_header, ElementId::EBML_MAX_ID_LENGTH, 4);
        uint_element(&mut ebml_header, ElementId::EBML_MAX_SIZE_LENGTH, 8);
        element(&mut ebml_header, ElementId::DOC_TYPE, b"webm");
        uint_element(&mut ebml_header, ElementId::DOC_TYPE_VERSION, 4);
        uint_element(&mut ebml_header, ElementId::DOC_TYPE_READ_VERSION, 2);
        element(&mut self.out, ElementId::EBML, &ebml_header);

        ebml::write_id(&mut self.out, ElementId::SEGMENT);
        ebml::write_unknown_size(&mut self.out);

        let app = concat!("voice-relay ", env!("CARGO_PKG_VERSION")).as_bytes();
        let mut info = Vec::new();
        uint_element(&mut info, ElementId::TIMECODE_SCALE, 1_000_000);
        element(&mut info, ElementId::MUXING_APP, app);
        element(&mut info, ElementId::WRITING_APP, app);
        element(&mut self.out, ElementId::INFO, &info);

        let mut audio = Vec::new();
        element(&mut audio, ElementId::SAMPLING_FREQUENCY, &(sample_rate as f64).to_be_bytes());
        uint_element(&mut audio, ElementId::CHANNELS, channels as u64);

        let mut entry = Vec::new();
        uint_element(&mut entry, ElementId::TRACK_NUMBER, AUDIO_TRACK);
        uint_element(&mut entry, ElementId::TRACK_UID, AUDIO_TRACK);
        uint_element(&mut entry, ElementId::TRACK_TYPE, 2);
        element(&mut entry, ElementId::CODEC_ID, b"A_OPUS");
        element(&mut entry, ElementId::CODEC_PRIVATE, &opus_head(sample_rate, channels));
        element(&mut entry, ElementId::AUDIO, &audio);

        let mut tracks = Vec::new();
        element(&mut tracks, ElementId::TRACK_ENTRY, &entry);
        element(&mut self.out, ElementId::TRACKS, &tracks);
    }

    /// Open a new cluster at the current timestamp
    pub fn start_cluster(&mut self) {
        ebml::write_id(&mut self.out, ElementId::CLUSTER);
        ebml::write_unknown_size(&mut self.out);
        uint_element(&mut self.out, ElementId::TIMECODE, self.timestamp_ms);
        self.cluster_ms = Some(self.timestamp_ms);
    }

    /// Append one coded frame as a keyframe `SimpleBlock`
    pub fn write_frame(&mut self, frame: &[u8]) {
        let relative = match self.cluster_ms {
            Some(start) if self.timestamp_ms - start <= i16::MAX as u64 => {
                self.timestamp_ms - start
            }
            _ => {
                self.start_cluster();
                0
            }
        };

        let mut block = Vec::with_capacity(frame.len() + 4);
        ebml::write_vint(&mut block, AUDIO_TRACK, 1);
        block.extend_from_slice(&(relative as i16).to_be_bytes());
        block.push(0x80);
        block.extend_from_slice(frame);
        element(&mut self.out, ElementId::SIMPLE_BLOCK, &block);

        self.timestamp_ms += self.frame_duration_ms;
        self.frames_written += 1;
    }

    /// Take everything written since the last call
    pub fn take_fragment(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.out))
    }

    /// Bytes waiting to be taken
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Timestamp of the next frame in milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}

fn element(out: &mut Vec<u8>, id: ElementId, payload: &[u8]) {
    ebml::write_id(out, id);
    ebml::write_size(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn uint_element(out: &mut Vec<u8>, id: ElementId, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|&&b| b == 0).count();
    element(out, id, &bytes[skip..]);
}

/// `OpusHead` identification header (RFC 7845, mapping family 0)
fn opus_head(sample_rate: u32, channels: u8) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&OPUS_PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&sample_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);
    head
}
