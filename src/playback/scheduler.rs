//! Gapless playback scheduling
//!
//! Each downlink message is one self-contained PCM chunk. Chunks are laid
//! back to back on the output clock: the first one starts "now", every
//! following one starts exactly where the previous one ends. If the
//! schedule falls behind the clock (network stall), it restarts from now.
//!
//! ```text
//!  clock ─────────────────────────────────────────────────────────►
//!         │ chunk 0 │ chunk 1 │ chunk 2 │      stall      │ chunk 3 │
//!         t0        t0+d0     t0+d0+d1                    now
//! ```

use crate::codec::PcmChunk;
use crate::error::{AudioError, PlaybackError};

/// Output device as seen by the scheduler
pub trait OutputDevice {
    /// Current output clock in seconds, `None` when the device has no
    /// usable clock
    fn current_time(&self) -> Option<f64>;

    /// Play `samples` (mono, `sample_rate`) starting at clock time `start_at`
    fn schedule(&mut self, start_at: f64, samples: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError>;

    /// Drop everything scheduled but not yet played
    fn flush(&mut self);

    /// Device error reported since the last call
    fn check_errors(&self) -> Option<AudioError> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
}

/// What happened to one inbound chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkOutcome {
    /// Queued on the device at this clock time
    Scheduled { start_at: f64 },
    /// Arrived while stopped
    Discarded,
    /// Zero samples
    Empty,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub chunks_scheduled: u64,
    pub chunks_discarded: u64,
    pub chunks_rejected: u64,
    /// Times the schedule was reset to the clock after falling behind
    pub resyncs: u64,
    pub seconds_scheduled: f64,
}

/// Places inbound PCM chunks on one output device's timeline
pub struct PlaybackScheduler<O: OutputDevice> {
    output: O,
    sample_rate: u32,
    state: SchedulerState,
    /// Clock time at which the next chunk must begin
    next_chunk_time: f64,
    /// Set when the clock could not be read; the next chunk starts at now
    needs_resync: bool,
    last_clock: Option<f64>,
    stats: SchedulerStats,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    pub fn new(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            state: SchedulerState::Idle,
            next_chunk_time: 0.0,
            needs_resync: false,
            last_clock: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Begin accepting chunks; continuity starts from the current clock
    pub fn start(&mut self) {
        match self.output.current_time() {
            Some(now) => {
                self.next_chunk_time = now;
                self.last_clock = Some(now);
                self.needs_resync = false;
            }
            None => {
                tracing::warn!("Output clock unavailable at start, will resync on first chunk");
                self.needs_resync = true;
                self.last_clock = None;
            }
        }
        self.state = SchedulerState::Scheduled;
        tracing::debug!("Playback scheduling started at {:.3}s", self.next_chunk_time);
    }

    /// Stop and drop everything not yet played
    pub fn stop(&mut self) {
        if self.state == SchedulerState::Idle {
            return;
        }
        self.state = SchedulerState::Idle;
        self.output.flush();
        tracing::debug!("Playback scheduling stopped");
    }

    /// Schedule one downlink message (little-endian i16 PCM)
    pub fn on_chunk(&mut self, data: &[u8]) -> Result<ChunkOutcome, PlaybackError> {
        if self.state == SchedulerState::Idle {
            self.stats.chunks_discarded += 1;
            return Ok(ChunkOutcome::Discarded);
        }

        let chunk = match PcmChunk::from_le_bytes(data, self.sample_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.chunks_rejected += 1;
                return Err(e);
            }
        };
        if chunk.is_empty() {
            return Ok(ChunkOutcome::Empty);
        }

        let Some(now) = self.output.current_time() else {
            self.needs_resync = true;
            self.stats.chunks_rejected += 1;
            return Err(PlaybackError::ClockUnavailable);
        };

        // A clock that went backwards means the device was reset
        let clock_reset = matches!(self.last_clock, Some(last) if now < last);
        self.last_clock = Some(now);

        if self.needs_resync || clock_reset || self.next_chunk_time < now {
            if !self.needs_resync {
                self.stats.resyncs += 1;
                tracing::debug!(
                    "Playback fell behind by {:.3}s, resyncing",
                    now - self.next_chunk_time
                );
            }
            self.next_chunk_time = now;
            self.needs_resync = false;
        }

        let start_at = self.next_chunk_time;
        self.output.schedule(start_at, chunk.to_f32(), self.sample_rate)?;

        let duration = chunk.duration_secs();
        self.next_chunk_time += duration;
        self.stats.chunks_scheduled += 1;
        self.stats.seconds_scheduled += duration;

        Ok(ChunkOutcome::Scheduled { start_at })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Clock time at which the next chunk would start
    pub fn next_chunk_time(&self) -> f64 {
        self.next_chunk_time
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Get statistics
    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ManualClock {
        now: Option<f64>,
        scheduled: Vec<(f64, Vec<f32>)>,
        flushes: usize,
    }

    impl OutputDevice for ManualClock {
        fn current_time(&self) -> Option<f64> {
            self.now
        }

        fn schedule(&mut self, start_at: f64, samples: Vec<f32>, _sample_rate: u32) -> Result<(), PlaybackError> {
            self.scheduled.push((start_at, samples));
            Ok(())
        }

        fn flush(&mut self) {
            self.scheduled.clear();
            self.flushes += 1;
        }
    }

    fn scheduler_at(now: f64) -> PlaybackScheduler<ManualClock> {
        let clock = ManualClock {
            now: Some(now),
            ..Default::default()
        };
        PlaybackScheduler::new(clock, 24000)
    }

    /// `samples` samples of silence as wire bytes
    fn pcm(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    fn start_times(s: &PlaybackScheduler<ManualClock>) -> Vec<f64> {
        s.output().scheduled.iter().map(|(t, _)| *t).collect()
    }

    #[test]
    fn test_back_to_back_without_stalls() {
        let mut s = scheduler_at(1.0);
        s.start();

        // 100 ms chunks
        for _ in 0..3 {
            s.on_chunk(&pcm(2400)).unwrap();
        }

        let times = start_times(&s);
        assert_eq!(times.len(), 3);
        assert!((times[0] - 1.0).abs() < 1e-9);
        assert!((times[1] - 1.1).abs() < 1e-9);
        assert!((times[2] - 1.2).abs() < 1e-9);
        assert!((s.next_chunk_time() - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_clock_advance_within_schedule_keeps_continuity() {
        let mut s = scheduler_at(0.0);
        s.start();
        s.on_chunk(&pcm(24000)).unwrap();

        s.output_mut().now = Some(0.5);
        let outcome = s.on_chunk(&pcm(2400)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Scheduled { start_at: 1.0 });
    }

    #[test]
    fn test_stall_resets_to_now() {
        let mut s = scheduler_at(0.0);
        s.start();
        s.on_chunk(&pcm(2400)).unwrap();

        s.output_mut().now = Some(5.0);
        let outcome = s.on_chunk(&pcm(2400)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Scheduled { start_at: 5.0 });
        assert_eq!(s.stats().resyncs, 1);
    }

    #[test]
    fn test_samples_are_scaled() {
        let mut s = scheduler_at(0.0);
        s.start();
        let mut data = Vec::new();
        for v in [i16::MIN, 0, 16384] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        s.on_chunk(&data).unwrap();
        assert_eq!(s.output().scheduled[0].1, vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_chunks_while_idle_are_discarded() {
        let mut s = scheduler_at(0.0);
        assert_eq!(s.on_chunk(&pcm(240)).unwrap(), ChunkOutcome::Discarded);
        assert!(s.output().scheduled.is_empty());
        assert_eq!(s.stats().chunks_discarded, 1);
    }

    #[test]
    fn test_stop_then_restart() {
        let mut s = scheduler_at(2.0);
        s.start();
        s.on_chunk(&pcm(24000)).unwrap();

        s.stop();
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.output().flushes, 1);
        assert!(s.output().scheduled.is_empty());

        assert_eq!(s.on_chunk(&pcm(240)).unwrap(), ChunkOutcome::Discarded);

        s.output_mut().now = Some(2.4);
        s.start();
        assert!((s.next_chunk_time() - 2.4).abs() < 1e-9);
        let outcome = s.on_chunk(&pcm(240)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Scheduled { start_at: 2.4 });
    }

    #[test]
    fn test_odd_length_chunk_is_rejected() {
        let mut s = scheduler_at(0.0);
        s.start();
        assert!(matches!(s.on_chunk(&[0, 0, 0]), Err(PlaybackError::OddByteLength(3))));
        assert!(s.output().scheduled.is_empty());

        // The stream carries on
        s.on_chunk(&pcm(240)).unwrap();
        assert_eq!(s.output().scheduled.len(), 1);
    }

    #[test]
    fn test_missing_clock_drops_and_resyncs() {
        let mut s = scheduler_at(1.0);
        s.start();
        s.on_chunk(&pcm(2400)).unwrap();

        s.output_mut().now = None;
        assert_eq!(s.on_chunk(&pcm(2400)), Err(PlaybackError::ClockUnavailable));

        s.output_mut().now = Some(1.05);
        let outcome = s.on_chunk(&pcm(2400)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Scheduled { start_at: 1.05 });
    }

    #[test]
    fn test_clock_going_backwards_is_a_stall() {
        let mut s = scheduler_at(10.0);
        s.start();
        s.on_chunk(&pcm(24000)).unwrap();

        s.output_mut().now = Some(0.2);
        let outcome = s.on_chunk(&pcm(2400)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Scheduled { start_at: 0.2 });
    }
}
