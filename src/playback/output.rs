//! cpal output device with a sample-accurate clock
//!
//! The render callback owns the clock: it is the number of frames written
//! to the device divided by the device rate. Scheduled buffers are placed
//! on that frame timeline and mixed in when their start frame comes up.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{default_output_device, map_build_error};
use crate::audio::resample::StreamResampler;
use crate::error::{AudioError, PlaybackError};
use crate::playback::scheduler::OutputDevice;

/// Start frames this close to where the previous buffer ends are joined
/// to it, absorbing rounding from rate conversion.
const JOIN_TOLERANCE_FRAMES: u64 = 4;

/// One buffer placed on the frame timeline
#[derive(Debug, Clone)]
struct ScheduledBuffer {
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Buffers waiting to be rendered, in start order
#[derive(Debug, Default)]
pub struct Timeline {
    buffers: Vec<ScheduledBuffer>,
}

impl Timeline {
    pub fn insert(&mut self, start_frame: u64, samples: Vec<f32>) {
        let at = self
            .buffers
            .partition_point(|b| b.start_frame <= start_frame);
        self.buffers.insert(at, ScheduledBuffer { start_frame, samples });
    }

    /// Mix frames `[base, base + out.len())` into `out` and drop buffers
    /// that are fully played
    pub fn render(&mut self, base: u64, out: &mut [f32]) {
        out.fill(0.0);
        let end = base + out.len() as u64;

        for buffer in &self.buffers {
            if buffer.start_frame >= end {
                break;
            }
            if buffer.end_frame() <= base {
                continue;
            }
            let from = buffer.start_frame.max(base);
            let to = buffer.end_frame().min(end);
            let src = &buffer.samples[(from - buffer.start_frame) as usize..(to - buffer.start_frame) as usize];
            let dst = &mut out[(from - base) as usize..(to - base) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }

        self.buffers.retain(|b| b.end_frame() > end);
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Frame at which the last buffer ends
    pub fn end_frame(&self) -> Option<u64> {
        self.buffers.iter().map(ScheduledBuffer::end_frame).max()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// State shared with the render callback
struct Shared {
    timeline: Mutex<Timeline>,
    frames_rendered: AtomicU64,
    failed: AtomicBool,
}

/// Default output device driven by a scheduler
pub struct DeviceOutput {
    shared: Arc<Shared>,
    device_rate: u32,
    /// Converts scheduled buffers to the device rate; continuous while
    /// buffers are back to back
    resampler: StreamResampler,
    /// First frame of the current run of back-to-back buffers
    run_start: Option<u64>,
    /// Frame where the resampled output placed so far ends
    placed_end: u64,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

impl DeviceOutput {
    /// Open the default output device for mono audio at `source_rate`
    pub fn open(source_rate: u32) -> Result<Self, AudioError> {
        let device = default_output_device()?;
        let (config, format) = device.output_config(source_rate)?;
        let device_rate = config.sample_rate.0;
        let resampler = StreamResampler::new(source_rate, device_rate)?;

        tracing::info!(
            "Starting playback on '{}': {} Hz, {} channel(s), {:?}",
            device.name,
            device_rate,
            config.channels,
            format
        );

        let shared = Arc::new(Shared {
            timeline: Mutex::new(Timeline::default()),
            frames_rendered: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        });
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let shared_for_thread = shared.clone();
        let running_for_loop = running.clone();
        let handle = thread::Builder::new()
            .name("playback-output".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let stream = match format {
                    SampleFormat::I16 => {
                        build_output_stream::<i16>(&cpal_device, &config, shared_for_thread, error_tx)
                    }
                    _ => build_output_stream::<f32>(&cpal_device, &config, shared_for_thread, error_tx),
                };

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
                return Err(AudioError::StreamError("playback thread exited".to_string()));
            }
        }

        Ok(Self {
            shared,
            device_rate,
            resampler,
            run_start: None,
            placed_end: 0,
            running,
            thread_handle: Some(handle),
            error_rx,
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Buffers scheduled but not fully played
    pub fn pending_buffers(&self) -> usize {
        self.shared.timeline.lock().len()
    }

    /// Stop the output stream
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl OutputDevice for DeviceOutput {
    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    fn current_time(&self) -> Option<f64> {
        if self.thread_handle.is_none() || self.shared.failed.load(Ordering::Acquire) {
            return None;
        }
        let frames = self.shared.frames_rendered.load(Ordering::Acquire);
        Some(frames as f64 / self.device_rate as f64)
    }

    fn schedule(&mut self, start_at: f64, samples: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(PlaybackError::Device("output stream failed".to_string()));
        }
        if sample_rate != self.resampler.from_rate() {
            self.end_run()?;
            self.resampler = StreamResampler::new(sample_rate, self.device_rate)
                .map_err(|e| PlaybackError::Device(e.to_string()))?;
        }

        let start_frame = (start_at * self.device_rate as f64).round() as u64;
        let joined = self.run_start.is_some_and(|run_start| {
            let run_end = run_start + self.resampler.expected_output_len();
            start_frame.abs_diff(run_end) <= JOIN_TOLERANCE_FRAMES
        });
        if !joined {
            // Not contiguous: finish the old run before starting over
            self.end_run()?;
            self.run_start = Some(start_frame);
            self.placed_end = start_frame;
        }

        let resampled = self
            .resampler
            .process(&samples)
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        self.place(resampled);
        Ok(())
    }

    fn flush(&mut self) {
        self.shared.timeline.lock().clear();
        self.resampler.reset();
        self.run_start = None;
    }
}

impl DeviceOutput {
    /// Place resampled output right after what is already placed
    fn place(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let start = self.placed_end;
        self.placed_end += samples.len() as u64;
        self.shared.timeline.lock().insert(start, samples);
    }

    /// Emit the resampler's buffered tail of the current run
    fn end_run(&mut self) -> Result<(), PlaybackError> {
        if self.run_start.take().is_none() {
            return Ok(());
        }
        let mut tail = Vec::new();
        self.resampler
            .flush_into(&mut tail)
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        self.place(tail);
        Ok(())
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mono = Vec::new();
    let shared_for_errors = shared.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);

                let base = shared.frames_rendered.load(Ordering::Acquire);
                shared.timeline.lock().render(base, &mut mono);

                for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                    let value = T::from_sample(sample.clamp(-1.0, 1.0));
                    frame.fill(value);
                }

                shared
                    .frames_rendered
                    .store(base + frames as u64, Ordering::Release);
            },
            move |err| {
                tracing::error!("Playback stream error: {}", err);
                shared_for_errors.failed.store(true, Ordering::Release);
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(map_build_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_to_back_buffers_render_without_gap() {
        let mut timeline = Timeline::default();
        timeline.insert(0, vec![1.0; 5]);
        timeline.insert(5, vec![2.0; 5]);

        let mut out = vec![0.0; 4];
        timeline.render(0, &mut out);
        assert_eq!(out, vec![1.0; 4]);

        timeline.render(4, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 2.0, 2.0]);

        timeline.render(8, &mut out);
        assert_eq!(out, vec![2.0, 2.0, 0.0, 0.0]);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_future_buffer_waits_for_its_frame() {
        let mut timeline = Timeline::default();
        timeline.insert(10, vec![0.5; 2]);

        let mut out = vec![0.0; 8];
        timeline.render(0, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(timeline.len(), 1);

        timeline.render(8, &mut out);
        assert_eq!(&out[..4], &[0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_late_buffer_plays_its_remainder() {
        let mut timeline = Timeline::default();
        timeline.insert(2, vec![1.0, 2.0, 3.0, 4.0]);

        let mut out = vec![0.0; 4];
        timeline.render(4, &mut out);
        assert_eq!(out, vec![3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut timeline = Timeline::default();
        timeline.insert(0, vec![1.0; 100]);
        timeline.clear();

        let mut out = vec![0.0; 4];
        timeline.render(0, &mut out);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(timeline.end_frame(), None);
    }
}
