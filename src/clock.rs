//! DSP clock for audio time reporting.
//!
//! The render callback advances the clock at the end of each period. Readers
//! take the `(frames, timestamp)` pair under a sequence lock and interpolate
//! with wall-clock time, so time advances smoothly between callbacks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct DspClock {
    sample_rate: u32,
    buffer_size: AtomicU32,
    origin: Instant,
    /// Odd while a write is in progress
    seq: AtomicU32,
    frames: AtomicU64,
    /// Nanoseconds since `origin` at the last advance; 0 = never advanced
    timestamp_ns: AtomicU64,
}

impl DspClock {
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self {
            sample_rate,
            buffer_size: AtomicU32::new(buffer_size),
            origin: Instant::now(),
            seq: AtomicU32::new(0),
            frames: AtomicU64::new(0),
            timestamp_ns: AtomicU64::new(0),
        }
    }

    /// Updates the period used to bound interpolation after a stream restart.
    pub fn set_buffer_size(&self, buffer_size: u32) {
        self.buffer_size.store(buffer_size, Ordering::Relaxed);
    }

    /// Render side: called once at the end of every callback.
    pub fn advance(&self, frames: u64) {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);

        let total = self.frames.load(Ordering::Relaxed) + frames;
        let now = (self.origin.elapsed().as_nanos() as u64).max(1);
        self.frames.store(total, Ordering::Relaxed);
        self.timestamp_ns.store(now, Ordering::Relaxed);

        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Consistent `(frames, timestamp_ns)` pair.
    fn snapshot(&self) -> (u64, u64) {
        loop {
            let s0 = self.seq.load(Ordering::Acquire);
            if s0 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frames = self.frames.load(Ordering::Relaxed);
            let ts = self.timestamp_ns.load(Ordering::Relaxed);
            std::sync::atomic::fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == s0 {
                return (frames, ts);
            }
        }
    }

    /// Total frames rendered, without interpolation.
    pub fn frames(&self) -> u64 {
        self.snapshot().0
    }

    /// Interpolated DSP time in seconds.
    ///
    /// Extrapolation past the last callback is clamped to two buffer
    /// periods so a stalled stream does not report runaway time.
    pub fn time_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        let (frames, ts) = self.snapshot();
        let base = frames as f64 / self.sample_rate as f64;
        if ts == 0 {
            return base;
        }

        let now = self.origin.elapsed().as_nanos() as u64;
        let elapsed = now.saturating_sub(ts) as f64 * 1e-9;
        let buffer_size = self.buffer_size.load(Ordering::Relaxed);
        let max_elapsed = if buffer_size > 0 {
            2.0 * buffer_size as f64 / self.sample_rate as f64
        } else {
            0.05
        };
        base + elapsed.clamp(0.0, max_elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fresh_clock_reads_zero() {
        let clock = DspClock::new(48000, 256);
        assert_eq!(clock.frames(), 0);
        assert_eq!(clock.time_seconds(), 0.0);
    }

    #[test]
    fn time_tracks_frames_with_bounded_interpolation() {
        let clock = DspClock::new(48000, 480);
        clock.advance(48000);
        assert_eq!(clock.frames(), 48000);

        let t = clock.time_seconds();
        assert!(t >= 1.0);
        // At most two periods (20 ms) of extrapolation.
        assert!(t <= 1.02 + 1e-9);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(clock.time_seconds() <= 1.02 + 1e-9);
    }

    #[test]
    fn readers_never_see_torn_pairs() {
        let clock = Arc::new(DspClock::new(1000, 10));
        let writer = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    clock.advance(10);
                }
            })
        };
        let mut last = 0;
        while !writer.is_finished() {
            let frames = clock.frames();
            assert!(frames >= last);
            assert_eq!(frames % 10, 0);
            last = frames;
        }
        writer.join().unwrap();
        assert_eq!(clock.frames(), 100_000);
    }
}
