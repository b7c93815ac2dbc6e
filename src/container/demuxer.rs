//! Incremental WebM demuxer
//!
//! Accepts the container stream in arbitrarily split pieces and releases
//! each leaf element once its payload is complete. Master elements are
//! entered structurally; unknown-size masters (as written by live
//! recorders for `Segment` and `Cluster`) end when a sibling or ancestor
//! level element shows up.

use bytes::{Buf, Bytes, BytesMut};

use crate::constants::DEFAULT_MAX_ELEMENT_SIZE;
use crate::container::ebml::{self, ElementId, ElementKind, ElementSize};
use crate::error::ContainerError;

/// A fully parsed leaf element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Element id (type tag)
    pub id: ElementId,
    /// Nesting depth, 0 for top-level elements
    pub depth: usize,
    /// Complete payload
    pub data: Bytes,
}

impl Element {
    /// Schema name, or `"Unknown"`
    pub fn name(&self) -> &'static str {
        ebml::schema(self.id).map(|e| e.name).unwrap_or("Unknown")
    }

    /// Whether this element carries coded audio frames
    pub fn is_block(&self) -> bool {
        self.id.is_block()
    }

    /// Interpret the payload as a big-endian unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        if self.data.len() > 8 {
            return None;
        }
        Some(self.data.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// Interpret the payload as an ASCII/UTF-8 string, trailing NULs trimmed
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data)
            .ok()
            .map(|s| s.trim_end_matches('\0'))
    }
}

/// A master element the parser is currently inside
#[derive(Debug, Clone)]
struct OpenMaster {
    id: ElementId,
    level: usize,
    /// Absolute end offset, `None` for unknown size
    end: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the next element header
    Header,
    /// Buffering a leaf payload
    Payload { id: ElementId, size: usize, depth: usize },
    /// Discarding bytes without buffering them
    Skip { remaining: u64 },
}

/// Incremental EBML/WebM demuxer for one stream
pub struct WebmDemuxer {
    buffer: BytesMut,
    /// Absolute stream offset of `buffer[0]`
    offset: u64,
    stack: Vec<OpenMaster>,
    state: State,
    max_element_size: usize,
    failed: bool,
    bytes_fed: u64,
    elements_emitted: u64,
    bytes_skipped: u64,
}

impl WebmDemuxer {
    /// Create a demuxer with the default element size limit
    pub fn new() -> Self {
        Self::with_max_element_size(DEFAULT_MAX_ELEMENT_SIZE)
    }

    /// Create a demuxer that rejects leaf elements above `max_element_size`
    pub fn with_max_element_size(max_element_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            offset: 0,
            stack: Vec::new(),
            state: State::Header,
            max_element_size,
            failed: false,
            bytes_fed: 0,
            elements_emitted: 0,
            bytes_skipped: 0,
        }
    }

    /// Feed the next piece of the stream.
    ///
    /// Returns every element completed by this piece, in stream order. A
    /// structural error poisons the demuxer: later calls return
    /// [`ContainerError::Poisoned`].
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Element>, ContainerError> {
        if self.failed {
            return Err(ContainerError::Poisoned);
        }

        self.bytes_fed += data.len() as u64;
        self.buffer.extend_from_slice(data);

        let mut elements = Vec::new();
        match self.drain(&mut elements) {
            Ok(()) => {
                self.elements_emitted += elements.len() as u64;
                Ok(elements)
            }
            Err(e) => {
                self.failed = true;
                self.buffer.clear();
                self.stack.clear();
                Err(e)
            }
        }
    }

    fn drain(&mut self, out: &mut Vec<Element>) -> Result<(), ContainerError> {
        loop {
            self.close_finished_masters();

            match self.state {
                State::Header => {
                    if !self.parse_header()? {
                        return Ok(());
                    }
                }
                State::Payload { id, size, depth } => {
                    if self.buffer.len() < size {
                        return Ok(());
                    }
                    let data = self.buffer.split_to(size).freeze();
                    self.offset += size as u64;
                    self.state = State::Header;
                    out.push(Element { id, depth, data });
                }
                State::Skip { remaining } => {
                    let n = remaining.min(self.buffer.len() as u64);
                    self.buffer.advance(n as usize);
                    self.offset += n;
                    self.bytes_skipped += n;

                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = State::Skip { remaining };
                        return Ok(());
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    /// Pop known-size masters whose range has been fully consumed
    fn close_finished_masters(&mut self) {
        while let Some(top) = self.stack.last() {
            match top.end {
                Some(end) if self.offset >= end => {
                    self.stack.pop();
                }
                _ => break,
            }
        }
    }

    /// Parse one element header. Returns `false` if more bytes are needed.
    fn parse_header(&mut self) -> Result<bool, ContainerError> {
        let Some((id, id_len)) = ebml::read_id(&self.buffer, self.offset)? else {
            return Ok(false);
        };
        let Some((size, size_len)) =
            ebml::read_size(&self.buffer[id_len..], self.offset + id_len as u64)?
        else {
            return Ok(false);
        };

        let entry = ebml::schema(id);

        // An unknown-size master ends where an element of its own level
        // (or shallower) begins.
        if let Some(level) = entry.and_then(|e| e.level) {
            while let Some(top) = self.stack.last() {
                if top.end.is_none() && level <= top.level {
                    self.stack.pop();
                } else {
                    break;
                }
            }
        }

        let depth = self.stack.len();
        let body_start = self.offset + (id_len + size_len) as u64;

        if let ElementSize::Known(n) = size {
            let parent_end = self.stack.last().and_then(|m| m.end);
            if matches!(parent_end, Some(end) if body_start + n > end) {
                return Err(ContainerError::ChildOverrunsParent { id: id.0 });
            }
        }

        self.buffer.advance(id_len + size_len);
        self.offset = body_start;

        let Some(entry) = entry else {
            // Unknown ids are opaque: skip them one level below the parent.
            return match size {
                ElementSize::Known(n) => {
                    tracing::trace!("Skipping unknown element {:#x} ({} bytes)", id.0, n);
                    self.state = State::Skip { remaining: n };
                    Ok(true)
                }
                ElementSize::Unknown => Err(ContainerError::UnknownSizeLeaf { id: id.0 }),
            };
        };

        match (entry.kind, size) {
            (ElementKind::Master, size) => {
                self.stack.push(OpenMaster {
                    id,
                    level: entry.level.unwrap_or(depth),
                    end: match size {
                        ElementSize::Known(n) => Some(body_start + n),
                        ElementSize::Unknown => None,
                    },
                });
                tracing::trace!("Entered {} at depth {}", entry.name, depth);
            }
            (ElementKind::Leaf, ElementSize::Unknown) => {
                return Err(ContainerError::UnknownSizeLeaf { id: id.0 });
            }
            (ElementKind::Leaf, ElementSize::Known(n)) if id == ElementId::VOID => {
                self.state = State::Skip { remaining: n };
            }
            (ElementKind::Leaf, ElementSize::Known(n)) => {
                if n > self.max_element_size as u64 {
                    return Err(ContainerError::ElementTooLarge {
                        id: id.0,
                        size: n,
                        max: self.max_element_size,
                    });
                }
                self.state = State::Payload {
                    id,
                    size: n as usize,
                    depth,
                };
            }
        }

        Ok(true)
    }

    /// Bytes received but not yet released as elements
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Ids of the master elements currently open, outermost first
    pub fn open_masters(&self) -> Vec<ElementId> {
        self.stack.iter().map(|m| m.id).collect()
    }

    /// Whether a previous feed failed
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Get statistics
    pub fn stats(&self) -> DemuxerStats {
        DemuxerStats {
            bytes_fed: self.bytes_fed,
            elements_emitted: self.elements_emitted,
            bytes_skipped: self.bytes_skipped,
            bytes_buffered: self.buffer.len(),
        }
    }
}

impl Default for WebmDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Demuxer statistics
#[derive(Debug, Clone, Default)]
pub struct DemuxerStats {
    pub bytes_fed: u64,
    pub elements_emitted: u64,
    pub bytes_skipped: u64,
    pub bytes_buffered: usize,
}
