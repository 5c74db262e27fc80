//! Outlier/spike filter for the PI servo (spec §4.1 "Spike rule").
//!
//! Keeps a ring of recent offsets (always) and recent frequencies (only
//! while the offset is judged "stable", so holdover-recovery swings never
//! poison the frequency mean used as a post-reset fallback).

use crate::ringbuffer::RingBuffer;

#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    pub size: usize,
    pub max_skip: u32,
    pub offset_stdev_factor: f64,
    pub freq_stdev_factor: f64,
    pub max_freq_change: f64,
    pub min_offset_locked: f64,
    pub offset_range: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            size: 30,
            max_skip: 10,
            offset_stdev_factor: 3.0,
            freq_stdev_factor: 3.0,
            max_freq_change: 1.0,
            min_offset_locked: 50.0,
            offset_range: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeVerdict {
    NotSpike,
    Spike,
    Reset,
}

#[derive(Debug, Clone)]
pub struct PiFilter {
    offsets: RingBuffer<f64>,
    freqs: RingBuffer<f64>,
    skipped_count: u32,
    last_offset: Option<f64>,
    cfg: FilterConfig,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn stdev(values: &[f64], m: f64) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
        var.sqrt()
    }
}

impl PiFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        PiFilter {
            offsets: RingBuffer::new(cfg.size),
            freqs: RingBuffer::new(cfg.size),
            skipped_count: 0,
            last_offset: None,
            cfg,
        }
    }

    pub fn config(&self) -> FilterConfig {
        self.cfg
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.freqs.clear();
        self.skipped_count = 0;
        self.last_offset = None;
    }

    pub fn skipped_count(&self) -> u32 {
        self.skipped_count
    }

    fn offset_stats(&self) -> (f64, f64) {
        let vals: Vec<f64> = self.offsets.iter_oldest_first().copied().collect();
        let m = mean(&vals);
        (m, stdev(&vals, m))
    }

    fn freq_stats(&self) -> (f64, f64) {
        let vals: Vec<f64> = self.freqs.iter_oldest_first().copied().collect();
        let m = mean(&vals);
        (m, stdev(&vals, m))
    }

    /// Mean frequency of the current window, if any samples exist. This is
    /// the retained fallback `last_freq` used on servo reset.
    pub fn mean_freq(&self) -> Option<f64> {
        if self.freqs.is_empty() {
            None
        } else {
            Some(self.freq_stats().0)
        }
    }

    /// True iff both the previous and the incoming offset fall within
    /// ±`offset_range`. False until a first sample has been recorded.
    pub fn is_stable(&self, offset: f64) -> bool {
        match self.last_offset {
            Some(prev) => {
                prev.abs() <= self.cfg.offset_range && offset.abs() <= self.cfg.offset_range
            }
            None => false,
        }
    }

    /// Evaluate whether `offset` is a spike given `seconds_since_last_correction`.
    /// Does not mutate `last_offset`; call [`PiFilter::record`] afterwards
    /// for an accepted (non-spike) sample.
    pub fn check(&mut self, offset: f64, seconds_since_last_correction: f64) -> SpikeVerdict {
        if !self.offsets.is_full() {
            return SpikeVerdict::NotSpike;
        }
        if self.skipped_count > self.cfg.max_skip {
            return SpikeVerdict::Reset;
        }
        let (_, offset_stdev) = self.offset_stats();
        let (_, freq_stdev) = self.freq_stats();
        let max_allowed = f64::max(
            self.cfg.min_offset_locked,
            self.cfg.offset_stdev_factor * offset_stdev,
        ) + seconds_since_last_correction.round()
            * (self.cfg.freq_stdev_factor * freq_stdev + self.cfg.max_freq_change / 2.0);

        if offset.abs() > max_allowed {
            self.skipped_count += 1;
            SpikeVerdict::Spike
        } else {
            SpikeVerdict::NotSpike
        }
    }

    /// Record an accepted (offset, freq) sample, clear the skip counter,
    /// and advance `last_offset`.
    pub fn record(&mut self, offset: f64, freq: f64) {
        let stable = self.is_stable(offset);
        self.offsets.push(offset);
        if stable {
            self.freqs.push(freq);
        }
        self.skipped_count = 0;
        self.last_offset = Some(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> FilterConfig {
        FilterConfig {
            size: 3,
            max_skip: 2,
            offset_range: 100_000.0,
            ..FilterConfig::default()
        }
    }

    #[test]
    fn never_spikes_before_ring_full() {
        let mut f = PiFilter::new(small_cfg());
        assert_eq!(f.check(1_000_000.0, 1.0), SpikeVerdict::NotSpike);
        f.record(1_000_000.0, 0.0);
        assert_eq!(f.check(1_000_000.0, 1.0), SpikeVerdict::NotSpike);
        f.record(1_000_000.0, 0.0);
    }

    #[test]
    fn resets_after_max_skip_confirmed_spikes() {
        let mut f = PiFilter::new(small_cfg());
        // Fill the ring with small, consistent offsets so stdev is tiny.
        for _ in 0..3 {
            f.record(100.0, 0.0);
        }
        assert!(f.offsets_full_for_test());

        // A wildly larger offset should register as a spike.
        assert_eq!(f.check(919_000.0, 1.0), SpikeVerdict::Spike);
        assert_eq!(f.skipped_count(), 1);
        assert_eq!(f.check(-921_000.0, 1.0), SpikeVerdict::Spike);
        assert_eq!(f.skipped_count(), 2);
        assert_eq!(f.check(921_000.0, 1.0), SpikeVerdict::Spike);
        assert_eq!(f.skipped_count(), 3);
        assert_eq!(f.check(921_000.0, 1.0), SpikeVerdict::Reset);
    }

    #[test]
    fn is_stable_requires_both_prev_and_current_in_range() {
        let mut f = PiFilter::new(FilterConfig {
            offset_range: 100.0,
            ..FilterConfig::default()
        });
        assert!(!f.is_stable(50.0)); // no previous sample yet
        f.record(50.0, 1.0);
        assert!(f.is_stable(60.0));
        f.record(200.0, 1.0); // out of range now becomes "previous"
        assert!(!f.is_stable(10.0));
    }

    impl PiFilter {
        fn offsets_full_for_test(&self) -> bool {
            self.offsets.is_full()
        }
    }
}
