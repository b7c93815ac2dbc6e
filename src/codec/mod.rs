//! Opus codec wrapper
//!
//! Server-side frame decoding to linear PCM, client-side voice encoding,
//! and the PCM chunk type shared by both directions.

pub mod decoder;
pub mod encoder;
pub mod pcm;

pub use decoder::{FrameDecoder, OpusFrameDecoder};
pub use encoder::OpusEncoder;
pub use pcm::PcmChunk;
