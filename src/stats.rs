//! RTT sliding average (§4.B) and the timestamp/delay-baseline history
//! used for one-way delay estimation (§3 "Timestamp history", §4.C).

/// Running mean/deviation over the last `W` samples, used to derive the
/// RTO floor: `max(min_timeout, mean + 2*deviation)`.
pub struct SlidingAverage<const W: usize> {
    samples: [i64; W],
    count: usize,
    next: usize,
}

impl<const W: usize> SlidingAverage<W> {
    pub fn new() -> Self {
        SlidingAverage {
            samples: [0; W],
            count: 0,
            next: 0,
        }
    }

    pub fn add_sample(&mut self, x: i64) {
        self.samples[self.next] = x;
        self.next = (self.next + 1) % W;
        if self.count < W {
            self.count += 1;
        }
    }

    pub fn mean(&self) -> i64 {
        if self.count == 0 {
            return 0;
        }
        let sum: i64 = self.samples[..self.count].iter().sum();
        sum / self.count as i64
    }

    /// Mean absolute deviation from the current mean.
    pub fn deviation(&self) -> i64 {
        if self.count == 0 {
            return 0;
        }
        let mean = self.mean();
        let sum: i64 = self.samples[..self.count]
            .iter()
            .map(|s| (s - mean).abs())
            .sum();
        sum / self.count as i64
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<const W: usize> Default for SlidingAverage<W> {
    fn default() -> Self {
        Self::new()
    }
}

const HISTORY_SIZE: usize = 20;
/// Don't step the base-delay history unless at least this many samples
/// have been observed since the last rotation — fewer suggests the
/// connection is idle and the samples aren't reliable (§3, §4.C).
const MIN_SAMPLES_BEFORE_STEP: u32 = 120;

/// Minimum-over-window baseline tracker with periodic rotation,
/// grounded on libtorrent's `timestamp_history`.
pub struct TimestampHistory {
    history: [u32; HISTORY_SIZE],
    base: u32,
    index: usize,
    num_samples: u32,
    initialized: bool,
}

impl TimestampHistory {
    pub fn new() -> Self {
        TimestampHistory {
            history: [0; HISTORY_SIZE],
            base: 0,
            index: 0,
            num_samples: 0,
            initialized: false,
        }
    }

    /// Add a sample, returning `sample - base` (the delay estimate).
    /// `step` requests a baseline rotation if enough samples have
    /// accrued since the last one.
    pub fn add_sample(&mut self, sample: u32, step: bool) -> u32 {
        if !self.initialized {
            self.history = [sample; HISTORY_SIZE];
            self.base = sample;
            self.num_samples = 0;
            self.initialized = true;
        }

        if self.num_samples < 0xfffe {
            self.num_samples += 1;
        }

        if wraps_less(sample, self.base) {
            self.base = sample;
            self.history[self.index] = sample;
        } else if wraps_less(sample, self.history[self.index]) {
            self.history[self.index] = sample;
        }

        let ret = sample.wrapping_sub(self.base);

        if step && self.num_samples > MIN_SAMPLES_BEFORE_STEP {
            self.num_samples = 0;
            self.index = (self.index + 1) % HISTORY_SIZE;
            self.history[self.index] = sample;
            self.base = sample;
            for h in self.history.iter() {
                if wraps_less(*h, self.base) {
                    self.base = *h;
                }
            }
        }
        ret
    }

    /// Compensate for a detected clock-drift `delta` on the peer side.
    pub fn adjust_base(&mut self, delta: i64) {
        self.base = (self.base as i64 + delta) as u32;
        for h in self.history.iter_mut() {
            if wraps_less(*h, self.base) {
                *h = self.base;
            }
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }
}

impl Default for TimestampHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// 32-bit wrap-safe `<` over the full u32 timestamp space.
fn wraps_less(lhs: u32, rhs: u32) -> bool {
    let dist_down = lhs.wrapping_sub(rhs);
    let dist_up = rhs.wrapping_sub(lhs);
    dist_up < dist_down
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_average_tracks_mean() {
        let mut avg: SlidingAverage<16> = SlidingAverage::new();
        for _ in 0..16 {
            avg.add_sample(100);
        }
        assert_eq!(avg.mean(), 100);
        assert_eq!(avg.deviation(), 0);
    }

    #[test]
    fn sliding_average_window_drops_old_samples() {
        let mut avg: SlidingAverage<4> = SlidingAverage::new();
        avg.add_sample(1000);
        avg.add_sample(1000);
        avg.add_sample(1000);
        avg.add_sample(1000);
        // pushes out all the 1000s
        avg.add_sample(0);
        avg.add_sample(0);
        avg.add_sample(0);
        avg.add_sample(0);
        assert_eq!(avg.mean(), 0);
    }

    #[test]
    fn timestamp_history_baseline_is_minimum() {
        let mut h = TimestampHistory::new();
        assert_eq!(h.add_sample(1000, false), 0);
        assert_eq!(h.add_sample(1500, false), 500);
        // a lower sample drags the base down
        assert_eq!(h.add_sample(800, false), 0);
    }

    #[test]
    fn timestamp_history_does_not_rotate_without_enough_samples() {
        let mut h = TimestampHistory::new();
        h.add_sample(1000, false);
        let base_before = h.base();
        h.add_sample(1200, true);
        // fewer than 120 samples since init - no rotation, base unaffected by rotation logic
        assert_eq!(h.base(), base_before);
    }
}
