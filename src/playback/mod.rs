//! Client-side playback of downlink PCM
//!
//! The scheduler decides when each chunk plays; the output device renders
//! it at that time.

pub mod output;
pub mod scheduler;

pub use output::DeviceOutput;
pub use scheduler::{ChunkOutcome, OutputDevice, PlaybackScheduler, SchedulerState, SchedulerStats};
