//! # Playback Scheduling
//!
//! Inbound model audio arrives in bursts and with jitter. Chunks are queued
//! back-to-back on the output context's clock so they never overlap and never
//! leave a gap while the queue is ahead of real time.

/// Time window a chunk was scheduled into, in output-clock seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub end: f64,
}

/// Tracks where the next chunk may start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackClock {
    next_start: f64,
}

impl PlaybackClock {
    /// Seed the clock at the output context's current time.
    pub fn new(now: f64) -> Self {
        Self { next_start: now }
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Reserve `duration` seconds for a chunk arriving at `now`.
    ///
    /// A late chunk (queue drained) starts immediately; an early one waits for
    /// the previous chunk to finish.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledChunk {
        let start = self.next_start.max(now);
        let end = start + duration.max(0.0);
        self.next_start = end;
        ScheduledChunk { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_queued_back_to_back() {
        let mut clock = PlaybackClock::new(1.0);
        let a = clock.schedule(1.0, 0.5);
        let b = clock.schedule(1.01, 0.25);
        let c = clock.schedule(1.02, 0.25);

        assert_eq!(a, ScheduledChunk { start: 1.0, end: 1.5 });
        assert_eq!(b.start, a.end);
        assert_eq!(c.start, b.end);
        assert_eq!(clock.next_start(), 2.0);
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let mut clock = PlaybackClock::new(0.0);
        clock.schedule(0.0, 0.5);
        let late = clock.schedule(3.0, 0.5);
        assert_eq!(late.start, 3.0);
        assert_eq!(clock.next_start(), 3.5);
    }

    #[test]
    fn test_chunks_never_overlap_or_start_in_the_past() {
        let arrivals = [(0.0, 0.2), (0.05, 0.2), (0.9, 0.1), (0.91, 0.4), (2.0, 0.0), (2.0, 0.3)];
        let mut clock = PlaybackClock::new(0.0);
        let mut previous: Option<ScheduledChunk> = None;

        for (now, duration) in arrivals {
            let chunk = clock.schedule(now, duration);
            assert!(chunk.start >= now);
            if let Some(prev) = previous {
                assert!(chunk.start >= prev.end);
            }
            previous = Some(chunk);
        }
    }
}
