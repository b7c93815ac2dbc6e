//! # Voice Relay
//!
//! Real-time voice bridge between a recording client and a remote
//! conversational audio session.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                 CLIENT                                    │
//! │  ┌────────────┐   ┌─────────────┐   ┌─────────────┐   ┌───────────────┐   │
//! │  │ Microphone │──►│    Opus     │──►│ WebM Writer │──►│  250ms        │   │
//! │  │ (cpal)     │   │   Encoder   │   │ (container) │   │  fragments    │   │
//! │  └────────────┘   └─────────────┘   └─────────────┘   └───────┬───────┘   │
//! │                                                               │           │
//! │  ┌────────────┐   ┌──────────────────────┐                    │           │
//! │  │  Speaker   │◄──│  Playback Scheduler  │◄───────────┐       │           │
//! │  │ (cpal)     │   │  (next_chunk_time)   │            │       │           │
//! │  └────────────┘   └──────────────────────┘            │       │           │
//! └───────────────────────────────────────────────────────┼───────┼───────────┘
//!                                      PCM 24kHz (binary) │       │ WebM/Opus
//!                                                         │       ▼ (binary)
//! ┌───────────────────────────────────────────────────────┼───────────────────┐
//! │                                 RELAY                 │                   │
//! │  ┌──────────────────────────────────────────────────────────────────────┐ │
//! │  │              Transport Bridge (relay::bridge), one per socket        │ │
//! │  │                                                                      │ │
//! │  │  ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌────────────────────┐   │ │
//! │  │  │ Demuxer  │──►│  Block  │──►│  Opus   │──►│   Uplink Relay     │   │ │
//! │  │  │  (EBML)  │   │  parse  │   │ Decoder │   │ base64, bounded    │   │ │
//! │  │  └──────────┘   └─────────┘   └─────────┘   └─────────┬──────────┘   │ │
//! │  │                                                       │              │ │
//! │  │  ┌──────────────────┐                                 │              │ │
//! │  │  │ Downlink forward │◄────────────────────┐           │              │ │
//! │  │  └──────────────────┘                     │           │              │ │
//! │  └───────────────────────────────────────────┼───────────┼──────────────┘ │
//! └──────────────────────────────────────────────┼───────────┼────────────────┘
//!                                                │           ▼
//!                                   ┌────────────┴──────────────────┐
//!                                   │  Remote session (Gemini Live) │
//!                                   └───────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod playback;
pub mod relay;
pub mod session;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Rate of the PCM sent to the remote session
    pub const UPLINK_SAMPLE_RATE: u32 = 16000;

    /// Rate of the PCM the remote session sends back
    pub const DOWNLINK_SAMPLE_RATE: u32 = 24000;

    /// Divisor mapping i16 samples into [-1.0, 1.0)
    pub const PCM_FULL_SCALE: f32 = 32768.0;

    /// Longest Opus packet duration
    pub const MAX_OPUS_FRAME_MS: u32 = 120;

    /// Largest container leaf buffered per connection
    pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 1024 * 1024;

    /// Smallest accepted leaf limit; a block holding one maximum-size Opus
    /// packet (1275 bytes) plus its headers must fit
    pub const MIN_MAX_ELEMENT_SIZE: usize = 4096;

    /// Default HTTP/WebSocket port
    pub const DEFAULT_HTTP_PORT: u16 = 3000;

    /// Decoded chunks waiting for the remote session
    pub const DEFAULT_UPLINK_QUEUE_DEPTH: usize = 64;

    /// Remote events waiting for the client transport
    pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 64;

    /// Recorder fragment interval
    pub const DEFAULT_TIMESLICE_MS: u64 = 250;

    /// Opus frame duration used by the client
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;

    /// Opus bitrate for speech
    pub const DEFAULT_VOICE_BITRATE: u32 = 32_000;

    /// Client capture and encode rate
    pub const CAPTURE_SAMPLE_RATE: u32 = 48000;

    pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

    pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-preview-native-audio-dialog";

    /// Persona sent as the system instruction
    pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert sales and support \
        assistant for Revolt Motors. You are enthusiastic, clear, and helpful. \
        Your sole purpose is to answer questions about Revolt's products and \
        company. Do not discuss other topics.";
}
