//! WebM/Matroska container handling
//!
//! Incremental demuxing of the client's recorder stream, block parsing,
//! and a small live writer for the native client.

pub mod block;
pub mod demuxer;
pub mod ebml;
pub mod writer;

pub use block::{Block, Lacing};
pub use demuxer::{DemuxerStats, Element, WebmDemuxer};
pub use ebml::ElementId;
pub use writer::WebmWriter;
