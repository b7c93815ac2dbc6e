//! Command-line conversation client: microphone capture, WebM/Opus
//! recording, relay transport and gapless playback.

pub mod driver;
pub mod recorder;
pub mod state;

pub use driver::ClientDriver;
pub use recorder::Recorder;
pub use state::{CaptureFailure, ClientAction, ClientEvent, ClientMachine, ClientState};
