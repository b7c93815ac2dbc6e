//! Microphone capture
//!
//! The cpal stream lives on a dedicated thread (streams are not `Send`).
//! The callback downmixes to mono, resamples to the requested rate and
//! hands blocks to the consumer over a bounded channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{input_device, map_build_error};
use crate::audio::resample::{downmix_to_mono, StreamResampler};
use crate::constants::PCM_FULL_SCALE;
use crate::error::AudioError;

/// Blocks buffered between the callback and the consumer
const CAPTURE_QUEUE_BLOCKS: usize = 64;

/// Running microphone capture
pub struct MicrophoneCapture {
    device_name: String,
    device_rate: u32,
    target_rate: u32,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Mono blocks at `target_rate`
    samples_rx: Receiver<Vec<f32>>,

    /// Channel for stream errors
    error_rx: Receiver<AudioError>,

    /// Samples delivered, at the target rate
    samples_captured: Arc<AtomicU64>,

    /// Blocks lost because the consumer fell behind
    blocks_dropped: Arc<AtomicU64>,
}

impl MicrophoneCapture {
    /// Open the named (or default) input device and start capturing mono
    /// samples at `target_rate`. Returns once the stream is playing.
    pub fn start(device_name: Option<&str>, target_rate: u32) -> Result<Self, AudioError> {
        let device = input_device(device_name)?;
        let (config, format) = device.input_config(target_rate)?;
        let name = device.name.clone();
        let device_rate = config.sample_rate.0;

        tracing::info!(
            "Starting capture on '{}': {} Hz, {} channel(s), {:?}",
            name,
            device_rate,
            config.channels,
            format
        );

        let (samples_tx, samples_rx) = bounded::<Vec<f32>>(CAPTURE_QUEUE_BLOCKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let samples_captured = Arc::new(AtomicU64::new(0));
        let blocks_dropped = Arc::new(AtomicU64::new(0));

        let mut block_sink = BlockSink {
            channels: config.channels as usize,
            resampler: StreamResampler::new(device_rate, target_rate)?,
            mono: Vec::new(),
            tx: samples_tx,
            samples_captured: samples_captured.clone(),
            blocks_dropped: blocks_dropped.clone(),
        };

        let running_for_loop = running.clone();
        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let stream = build_input_stream(
                    &cpal_device,
                    &config,
                    format,
                    move |data| block_sink.push(data),
                    error_tx,
                );

                let stream = match stream.and_then(|s| {
                    s.play()
                        .map_err(|e| AudioError::StreamError(e.to_string()))
                        .map(|_| s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("capture thread exited".to_string()));
            }
        }

        Ok(Self {
            device_name: name,
            device_rate,
            target_rate,
            running,
            thread_handle: Some(handle),
            samples_rx,
            error_rx,
            samples_captured,
            blocks_dropped,
        })
    }

    /// Everything captured since the last call, concatenated
    pub fn drain(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for block in self.samples_rx.try_iter() {
            out.extend_from_slice(&block);
        }
        out
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture on '{}' stopped", self.device_name);
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Native rate of the device
    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Rate of the delivered samples
    pub fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    /// Get total samples captured
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Callback side: interleaved device samples in, mono blocks out
struct BlockSink {
    channels: usize,
    resampler: StreamResampler,
    mono: Vec<f32>,
    tx: Sender<Vec<f32>>,
    samples_captured: Arc<AtomicU64>,
    blocks_dropped: Arc<AtomicU64>,
}

impl BlockSink {
    fn push(&mut self, interleaved: &[f32]) {
        self.mono.clear();
        downmix_to_mono(interleaved, self.channels, &mut self.mono);
        let block = match self.resampler.process(&self.mono) {
            Ok(block) => block,
            Err(_) => {
                self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if block.is_empty() {
            return;
        }

        let len = block.len() as u64;
        match self.tx.try_send(block) {
            Ok(()) => {
                self.samples_captured.fetch_add(len, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn build_input_stream<F>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut on_samples: F,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    F: FnMut(&[f32]) + Send + 'static,
{
    let on_error = move |err: cpal::StreamError| {
        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| s as f32 / PCM_FULL_SCALE));
                    on_samples(&scratch);
                },
                on_error,
                None,
            )
        }
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    };

    stream.map_err(map_build_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sink_downmixes_and_resamples() {
        let (tx, rx) = bounded(64);
        let mut sink = BlockSink {
            channels: 2,
            resampler: StreamResampler::new(48000, 16000).unwrap(),
            mono: Vec::new(),
            tx,
            samples_captured: Arc::new(AtomicU64::new(0)),
            blocks_dropped: Arc::new(AtomicU64::new(0)),
        };

        // 200 ms of stereo at 48 kHz in 10 ms callbacks
        for _ in 0..20 {
            sink.push(&[0.5; 960]);
        }
        let samples: Vec<f32> = rx.try_iter().flatten().collect();

        // Everything but the resampler's last buffered chunk is out
        assert!(samples.len() >= 3000 && samples.len() <= 3200, "got {}", samples.len());
        assert_eq!(sink.samples_captured.load(Ordering::Relaxed), samples.len() as u64);
        assert!(samples[400..].iter().all(|&s| (s - 0.5).abs() < 0.01));
    }

    #[test]
    fn test_block_sink_counts_overflow() {
        let (tx, _rx) = bounded(1);
        let mut sink = BlockSink {
            channels: 1,
            resampler: StreamResampler::new(16000, 16000).unwrap(),
            mono: Vec::new(),
            tx,
            samples_captured: Arc::new(AtomicU64::new(0)),
            blocks_dropped: Arc::new(AtomicU64::new(0)),
        };

        sink.push(&[0.0; 160]);
        sink.push(&[0.0; 160]);
        assert_eq!(sink.blocks_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_capture_start() {
        // Only meaningful where an input device exists
        if input_device(None).is_err() {
            return;
        }
        if let Ok(mut capture) = MicrophoneCapture::start(None, 48000) {
            assert!(capture.is_running());
            assert_eq!(capture.sample_rate(), 48000);
            capture.stop();
            assert!(!capture.is_running());
        }
    }
}
