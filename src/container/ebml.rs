//! EBML primitives
//!
//! Variable-length integers, element ids and the subset of the
//! Matroska/WebM schema the demuxer needs to walk a live stream.

use crate::error::ContainerError;

/// Maximum length of an element id in bytes
pub const MAX_ID_LENGTH: usize = 4;

/// Maximum length of an element size in bytes
pub const MAX_SIZE_LENGTH: usize = 8;

/// EBML element id, marker bits included (e.g. `0x1A45DFA3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u32);

impl ElementId {
    pub const EBML: ElementId = ElementId(0x1A45_DFA3);
    pub const EBML_VERSION: ElementId = ElementId(0x4286);
    pub const EBML_READ_VERSION: ElementId = ElementId(0x42F7);
    pub const EBML_MAX_ID_LENGTH: ElementId = ElementId(0x42F2);
    pub const EBML_MAX_SIZE_LENGTH: ElementId = ElementId(0x42F3);
    pub const DOC_TYPE: ElementId = ElementId(0x4282);
    pub const DOC_TYPE_VERSION: ElementId = ElementId(0x4287);
    pub const DOC_TYPE_READ_VERSION: ElementId = ElementId(0x4285);

    pub const VOID: ElementId = ElementId(0xEC);
    pub const CRC32: ElementId = ElementId(0xBF);

    pub const SEGMENT: ElementId = ElementId(0x1853_8067);
    pub const SEEK_HEAD: ElementId = ElementId(0x114D_9B74);
    pub const INFO: ElementId = ElementId(0x1549_A966);
    pub const TIMECODE_SCALE: ElementId = ElementId(0x2A_D7B1);
    pub const MUXING_APP: ElementId = ElementId(0x4D80);
    pub const WRITING_APP: ElementId = ElementId(0x5741);

    pub const TRACKS: ElementId = ElementId(0x1654_AE6B);
    pub const TRACK_ENTRY: ElementId = ElementId(0xAE);
    pub const TRACK_NUMBER: ElementId = ElementId(0xD7);
    pub const TRACK_UID: ElementId = ElementId(0x73C5);
    pub const TRACK_TYPE: ElementId = ElementId(0x83);
    pub const CODEC_ID: ElementId = ElementId(0x86);
    pub const CODEC_PRIVATE: ElementId = ElementId(0x63A2);
    pub const AUDIO: ElementId = ElementId(0xE1);
    pub const SAMPLING_FREQUENCY: ElementId = ElementId(0xB5);
    pub const CHANNELS: ElementId = ElementId(0x9F);

    pub const CLUSTER: ElementId = ElementId(0x1F43_B675);
    pub const TIMECODE: ElementId = ElementId(0xE7);
    pub const SIMPLE_BLOCK: ElementId = ElementId(0xA3);
    pub const BLOCK_GROUP: ElementId = ElementId(0xA0);
    pub const BLOCK: ElementId = ElementId(0xA1);

    pub const CUES: ElementId = ElementId(0x1C53_BB6B);
    pub const CHAPTERS: ElementId = ElementId(0x1043_A770);
    pub const TAGS: ElementId = ElementId(0x1254_C367);
    pub const ATTACHMENTS: ElementId = ElementId(0x1941_A469);

    /// Whether this element carries coded audio frames
    pub fn is_block(self) -> bool {
        self == Self::SIMPLE_BLOCK || self == Self::BLOCK
    }

    /// Number of bytes this id occupies on the wire
    pub fn encoded_len(self) -> usize {
        match self.0 {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            0x1_0000..=0xFF_FFFF => 3,
            _ => 4,
        }
    }
}

/// How an element's body is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Contains child elements
    Master,
    /// Opaque payload
    Leaf,
}

/// Schema entry for a known element
#[derive(Debug, Clone, Copy)]
pub struct SchemaEntry {
    pub name: &'static str,
    pub kind: ElementKind,
    /// Nesting level, `None` for global elements allowed anywhere
    pub level: Option<usize>,
}

/// Look up the schema entry for an id
pub fn schema(id: ElementId) -> Option<SchemaEntry> {
    use ElementKind::*;

    let (name, kind, level) = match id {
        ElementId::EBML => ("EBML", Master, Some(0)),
        ElementId::EBML_VERSION => ("EBMLVersion", Leaf, Some(1)),
        ElementId::EBML_READ_VERSION => ("EBMLReadVersion", Leaf, Some(1)),
        ElementId::EBML_MAX_ID_LENGTH => ("EBMLMaxIDLength", Leaf, Some(1)),
        ElementId::EBML_MAX_SIZE_LENGTH => ("EBMLMaxSizeLength", Leaf, Some(1)),
        ElementId::DOC_TYPE => ("DocType", Leaf, Some(1)),
        ElementId::DOC_TYPE_VERSION => ("DocTypeVersion", Leaf, Some(1)),
        ElementId::DOC_TYPE_READ_VERSION => ("DocTypeReadVersion", Leaf, Some(1)),

        ElementId::VOID => ("Void", Leaf, None),
        ElementId::CRC32 => ("CRC-32", Leaf, None),

        ElementId::SEGMENT => ("Segment", Master, Some(0)),
        ElementId::SEEK_HEAD => ("SeekHead", Master, Some(1)),
        ElementId::INFO => ("Info", Master, Some(1)),
        ElementId::TIMECODE_SCALE => ("TimecodeScale", Leaf, Some(2)),
        ElementId::MUXING_APP => ("MuxingApp", Leaf, Some(2)),
        ElementId::WRITING_APP => ("WritingApp", Leaf, Some(2)),

        ElementId::TRACKS => ("Tracks", Master, Some(1)),
        ElementId::TRACK_ENTRY => ("TrackEntry", Master, Some(2)),
        ElementId::TRACK_NUMBER => ("TrackNumber", Leaf, Some(3)),
        ElementId::TRACK_UID => ("TrackUID", Leaf, Some(3)),
        ElementId::TRACK_TYPE => ("TrackType", Leaf, Some(3)),
        ElementId::CODEC_ID => ("CodecID", Leaf, Some(3)),
        ElementId::CODEC_PRIVATE => ("CodecPrivate", Leaf, Some(3)),
        ElementId::AUDIO => ("Audio", Master, Some(3)),
        ElementId::SAMPLING_FREQUENCY => ("SamplingFrequency", Leaf, Some(4)),
        ElementId::CHANNELS => ("Channels", Leaf, Some(4)),

        ElementId::CLUSTER => ("Cluster", Master, Some(1)),
        ElementId::TIMECODE => ("Timecode", Leaf, Some(2)),
        ElementId::SIMPLE_BLOCK => ("SimpleBlock", Leaf, Some(2)),
        ElementId::BLOCK_GROUP => ("BlockGroup", Master, Some(2)),
        ElementId::BLOCK => ("Block", Leaf, Some(3)),

        ElementId::CUES => ("Cues", Master, Some(1)),
        ElementId::CHAPTERS => ("Chapters", Master, Some(1)),
        ElementId::TAGS => ("Tags", Master, Some(1)),
        ElementId::ATTACHMENTS => ("Attachments", Master, Some(1)),

        _ => return None,
    };

    Some(SchemaEntry { name, kind, level })
}

/// Length of a vint from its first byte, `None` if the byte has no marker
/// within `max_len` bits.
fn vint_length(first: u8, max_len: usize) -> Option<usize> {
    let len = first.leading_zeros() as usize + 1;
    if first == 0 || len > max_len {
        None
    } else {
        Some(len)
    }
}

/// Read an element id (marker kept).
///
/// Returns `Ok(None)` when `buf` does not yet hold the whole id.
pub fn read_id(buf: &[u8], offset: u64) -> Result<Option<(ElementId, usize)>, ContainerError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let len = vint_length(first, MAX_ID_LENGTH)
        .ok_or(ContainerError::InvalidElementId { offset })?;
    if buf.len() < len {
        return Ok(None);
    }

    let id = buf[..len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok(Some((ElementId(id), len)))
}

/// A decoded element size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    Known(u64),
    Unknown,
}

/// Read an element size (marker stripped).
///
/// Returns `Ok(None)` when `buf` does not yet hold the whole size.
pub fn read_size(buf: &[u8], offset: u64) -> Result<Option<(ElementSize, usize)>, ContainerError> {
    let Some((value, len)) = read_vint(buf, offset)? else {
        return Ok(None);
    };

    let all_ones = (1u64 << (7 * len)) - 1;
    let size = if value == all_ones {
        ElementSize::Unknown
    } else {
        ElementSize::Known(value)
    };
    Ok(Some((size, len)))
}

/// Read an unsigned vint with the length marker stripped.
pub fn read_vint(buf: &[u8], offset: u64) -> Result<Option<(u64, usize)>, ContainerError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let len = vint_length(first, MAX_SIZE_LENGTH).ok_or(ContainerError::InvalidVint { offset })?;
    if buf.len() < len {
        return Ok(None);
    }

    // Mask off the marker bit; for 8-byte vints the first byte is all marker.
    let mut value = if len == 8 {
        0
    } else {
        (first & (0xFF >> len)) as u64
    };
    for &b in &buf[1..len] {
        value = (value << 8) | b as u64;
    }
    Ok(Some((value, len)))
}

/// Read a signed vint as used by EBML lacing size deltas.
pub fn read_signed_vint(buf: &[u8], offset: u64) -> Result<Option<(i64, usize)>, ContainerError> {
    let Some((value, len)) = read_vint(buf, offset)? else {
        return Ok(None);
    };
    let bias = (1i64 << (7 * len - 1)) - 1;
    Ok(Some((value as i64 - bias, len)))
}

/// Encode an element id
pub fn write_id(out: &mut Vec<u8>, id: ElementId) {
    let len = id.encoded_len();
    out.extend_from_slice(&id.0.to_be_bytes()[4 - len..]);
}

/// Encode a size using the shortest vint that fits
pub fn write_size(out: &mut Vec<u8>, size: u64) {
    let mut len = 1;
    // All-ones is reserved for "unknown", so the usable range is one less.
    while len < MAX_SIZE_LENGTH && size >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    write_vint(out, size, len);
}

/// Encode the reserved "unknown size" marker (8 bytes)
pub fn write_unknown_size(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
}

/// Encode `value` as a vint of exactly `len` bytes
pub fn write_vint(out: &mut Vec<u8>, value: u64, len: usize) {
    let marked = value | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}
