//! Error types for the voice relay

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// WebM/EBML structure errors.
///
/// Every variant is fatal for the stream that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("Invalid variable-length integer at offset {offset}")]
    InvalidVint { offset: u64 },

    #[error("Invalid element id at offset {offset}")]
    InvalidElementId { offset: u64 },

    #[error("Element {id:#x} has unknown size but is not a master element")]
    UnknownSizeLeaf { id: u32 },

    #[error("Element {id:#x} is {size} bytes, limit is {max}")]
    ElementTooLarge { id: u32, size: u64, max: usize },

    #[error("Element {id:#x} overruns its parent")]
    ChildOverrunsParent { id: u32 },

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Demuxer already failed on this stream")]
    Poisoned,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),
}

/// Remote conversational session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Missing API key")]
    MissingApiKey,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Session setup timed out after {0} ms")]
    SetupTimeout(u64),

    #[error("Session setup rejected: {0}")]
    SetupRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Client transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

/// Client-side playback errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Output clock unavailable")]
    ClockUnavailable,

    #[error("PCM chunk has odd byte length {0}")]
    OddByteLength(usize),

    #[error("Output device error: {0}")]
    Device(String),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
