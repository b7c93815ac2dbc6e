//! Server-side relay
//!
//! Everything between a client transport and a remote session: the
//! inbound demux/decode pipeline, the bounded uplink and the bridge that
//! ties both directions to one connection.

pub mod bridge;
pub mod pipeline;
pub mod uplink;

pub use bridge::{CloseReason, ConnectionSession, ConnectionSummary, DownlinkStats, TransportBridge};
pub use pipeline::{FeedReport, InboundPipeline, PipelineStats};
pub use uplink::{SubmitOutcome, UplinkRelay, UplinkStats};
