//! Audio device I/O helpers

pub mod capture;
pub mod device;
pub mod resample;

pub use capture::MicrophoneCapture;
pub use device::{default_output_device, input_device, list_devices, AudioDevice, DeviceInfo};
pub use resample::StreamResampler;
