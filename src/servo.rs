//! PI servo with outlier rejection (spec §4.1).
//!
//! The hardest algorithmic core of the crate: consumes (offset, local_ts)
//! pairs and returns a frequency correction plus a lifecycle state the
//! caller dispatches on (do nothing / step / retune). Two gain profiles —
//! "fast" for startup/reset and "slow" for steady state — are selected
//! automatically on lock/unlock transitions.

use crate::filter::{FilterConfig, PiFilter, SpikeVerdict};
use crate::traits::ServoController;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    Init,
    Jump,
    Locked,
}

/// Per-profile gain shaping: `kp = min(scale * interval^exponent,
/// norm_max / interval)`, and likewise for `ki`.
#[derive(Debug, Clone, Copy)]
pub struct ServoProfile {
    pub kp_scale: f64,
    pub kp_exponent: f64,
    pub ki_scale: f64,
    pub ki_exponent: f64,
    pub kp_norm_max: f64,
    pub ki_norm_max: f64,
}

impl ServoProfile {
    /// Aggressive profile used at startup and immediately after a reset.
    pub fn fast() -> Self {
        ServoProfile {
            kp_scale: 0.7,
            kp_exponent: 0.0,
            ki_scale: 0.3,
            ki_exponent: 0.0,
            kp_norm_max: 0.7,
            ki_norm_max: 0.3,
        }
    }

    /// Gentler profile used once the servo has locked.
    pub fn slow() -> Self {
        ServoProfile {
            kp_scale: 0.15,
            kp_exponent: 0.0,
            ki_scale: 0.005,
            ki_exponent: 0.0,
            kp_norm_max: 0.15,
            ki_norm_max: 0.005,
        }
    }

    fn gains(&self, interval_s: f64) -> (f64, f64) {
        let kp = (self.kp_scale * interval_s.powf(self.kp_exponent)).min(self.kp_norm_max / interval_s);
        let ki = (self.ki_scale * interval_s.powf(self.ki_exponent)).min(self.ki_norm_max / interval_s);
        (kp, ki)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PiServoConfig {
    /// Symmetric frequency cap in PPB.
    pub max_freq: f64,
    /// First-ever jump threshold in ns; 0 disables it.
    pub first_step_threshold: i64,
    /// Steady-state jump threshold in ns; 0 disables it.
    pub step_threshold: i64,
    /// Whether `first_step_threshold` applies to the first INIT→LOCKED
    /// transition.
    pub first_update: bool,
    /// Safety margin applied to the minimum observation interval check.
    pub freq_est_margin: f64,
}

impl Default for PiServoConfig {
    fn default() -> Self {
        PiServoConfig {
            max_freq: 500_000.0,
            first_step_threshold: 0,
            step_threshold: 0,
            first_update: false,
            freq_est_margin: 0.0,
        }
    }
}

pub struct PiServo {
    cfg: PiServoConfig,
    fast: ServoProfile,
    slow: ServoProfile,
    using_fast: bool,
    kp: f64,
    ki: f64,
    interval_s: f64,
    count: u8,
    drift: f64,
    last_freq: f64,
    first_sample: Option<(i64, u64)>,
    first_transition_done: bool,
    filter: PiFilter,
    last_correction_time: Instant,
}

impl PiServo {
    pub fn new(initial_freq: f64, cfg: PiServoConfig, filter_cfg: FilterConfig) -> Self {
        Self::with_profiles(initial_freq, cfg, filter_cfg, ServoProfile::fast(), ServoProfile::slow())
    }

    pub fn with_profiles(
        initial_freq: f64,
        cfg: PiServoConfig,
        filter_cfg: FilterConfig,
        fast: ServoProfile,
        slow: ServoProfile,
    ) -> Self {
        let interval_s = 1.0;
        let (kp, ki) = fast.gains(interval_s);
        PiServo {
            cfg,
            fast,
            slow,
            using_fast: true,
            kp,
            ki,
            interval_s,
            count: 0,
            drift: initial_freq,
            last_freq: initial_freq,
            first_sample: None,
            first_transition_done: false,
            filter: PiFilter::new(filter_cfg),
            last_correction_time: Instant::now(),
        }
    }

    pub fn sync_interval(&mut self, seconds: f64) {
        self.interval_s = seconds.max(1e-6);
        self.recompute_gains();
    }

    fn recompute_gains(&mut self) {
        let profile = if self.using_fast { &self.fast } else { &self.slow };
        let (kp, ki) = profile.gains(self.interval_s);
        self.kp = kp;
        self.ki = ki;
    }

    fn use_fast_profile(&mut self) {
        self.using_fast = true;
        self.recompute_gains();
    }

    fn use_slow_profile(&mut self) {
        self.using_fast = false;
        self.recompute_gains();
    }

    pub fn unlock(&mut self) {
        self.use_fast_profile();
        self.filter.clear();
        self.count = 0;
    }

    pub fn mean_freq(&self) -> f64 {
        self.filter.mean_freq().unwrap_or(self.last_freq)
    }

    pub fn is_stable(&self, offset: i64) -> bool {
        self.filter.is_stable(offset as f64)
    }

    /// Queries the filter for a spike; on "spike" or "reset" the caller
    /// must not feed `offset` to [`PiServo::sample`].
    pub fn is_spike(&mut self, offset: i64) -> bool {
        let secs_since_correction = self.last_correction_time.elapsed().as_secs_f64();
        match self.filter.check(offset as f64, secs_since_correction) {
            SpikeVerdict::NotSpike => false,
            SpikeVerdict::Spike => true,
            SpikeVerdict::Reset => {
                self.reset_from_filter();
                true
            }
        }
    }

    fn reset_from_filter(&mut self) {
        let retained_freq = self.filter.mean_freq().unwrap_or(self.last_freq);
        self.count = 0;
        self.drift = 0.0;
        self.filter.clear();
        self.use_fast_profile();
        self.last_freq = retained_freq;
    }

    pub fn sample(&mut self, offset: i64, local_ts: u64) -> (f64, ServoState) {
        match self.count {
            0 => {
                self.first_sample = Some((offset, local_ts));
                self.count = 1;
                (self.last_freq, ServoState::Init)
            }
            1 => {
                let (first_offset, first_ts) =
                    self.first_sample.expect("count==1 implies a stored first sample");
                if local_ts <= first_ts {
                    self.count = 0;
                    return (self.last_freq, ServoState::Init);
                }
                let delta_local_ns = (local_ts - first_ts) as f64;
                let delta_local_s = delta_local_ns / 1e9;
                let min_interval = (0.016 / self.ki).min(1000.0);
                if delta_local_s * (1.0 + self.cfg.freq_est_margin) < min_interval {
                    log::warn!(
                        "servo: interval {:.6}s below minimum {:.6}s, keeping count=1",
                        delta_local_s,
                        min_interval
                    );
                    return (self.last_freq, ServoState::Init);
                }

                let delta_offset = (offset - first_offset) as f64;
                let mut drift = self.drift + (1_000_000_000.0 - self.drift) * delta_offset / delta_local_ns;
                drift = drift.clamp(-self.cfg.max_freq, self.cfg.max_freq);
                self.drift = drift;

                let is_first_transition = !self.first_transition_done;
                self.first_transition_done = true;

                let jump = (is_first_transition
                    && self.cfg.first_update
                    && self.cfg.first_step_threshold > 0
                    && offset.abs() > self.cfg.first_step_threshold)
                    || (self.cfg.step_threshold != 0 && offset.abs() > self.cfg.step_threshold);

                self.count = 2;
                self.last_freq = drift;

                let state = if jump {
                    self.use_fast_profile();
                    ServoState::Jump
                } else {
                    self.use_slow_profile();
                    ServoState::Locked
                };
                (drift, state)
            }
            _ => {
                if self.cfg.step_threshold != 0 && offset.abs() > self.cfg.step_threshold {
                    self.count = 0;
                    self.filter.clear();
                    self.use_fast_profile();
                    return (self.last_freq, ServoState::Init);
                }

                let ki_term = self.ki * offset as f64;
                let raw_ppb = self.kp * offset as f64 + self.drift + ki_term;
                let clamped_ppb = raw_ppb.clamp(-self.cfg.max_freq, self.cfg.max_freq);
                if (clamped_ppb - raw_ppb).abs() < f64::EPSILON {
                    self.drift += ki_term;
                }

                self.last_freq = clamped_ppb;
                self.filter.record(offset as f64, clamped_ppb);
                self.last_correction_time = Instant::now();
                (clamped_ppb, ServoState::Locked)
            }
        }
    }
}

impl ServoController for PiServo {
    fn sample(&mut self, offset_ns: i64, local_ts: u64) -> (f64, ServoState) {
        PiServo::sample(self, offset_ns, local_ts)
    }

    fn is_spike(&mut self, offset_ns: i64) -> bool {
        PiServo::is_spike(self, offset_ns)
    }

    fn unlock(&mut self) {
        PiServo::unlock(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servo(max_freq: f64, step_threshold: i64, first_step_threshold: i64, first_update: bool) -> PiServo {
        let cfg = PiServoConfig {
            max_freq,
            first_step_threshold,
            step_threshold,
            first_update,
            freq_est_margin: 0.0,
        };
        let mut s = PiServo::new(0.0, cfg, FilterConfig::default());
        s.sync_interval(1.0);
        s
    }

    #[test]
    fn first_sample_returns_init_unchanged() {
        let mut s = servo(500_000.0, 0, 0, false);
        let (freq, state) = s.sample(1191, 1_674_148_530_671_467_104);
        assert_eq!(freq, 0.0);
        assert_eq!(state, ServoState::Init);
    }

    #[test]
    fn nonmonotone_second_timestamp_resets_to_init() {
        let mut s = servo(500_000.0, 0, 0, false);
        s.sample(1191, 1000);
        let (_, state) = s.sample(225, 1000); // not > first
        assert_eq!(state, ServoState::Init);
        // count dropped back to 0: next call is treated as a fresh first sample
        let (freq, state2) = s.sample(50, 2000);
        assert_eq!(state2, ServoState::Init);
        assert_eq!(freq, 0.0);
    }

    #[test]
    fn drift_and_output_never_exceed_max_freq() {
        let mut s = servo(500_000.0, 0, 0, false);
        s.sample(1_000_000_000, 0);
        let (freq, _) = s.sample(-1_000_000_000, 2_000_000_000);
        assert!(freq.abs() <= 500_000.0);
        for _ in 0..50 {
            let (freq, _) = s.sample(1_000_000, 0);
            assert!(freq.abs() <= 500_000.0);
        }
    }

    #[test]
    fn step_threshold_breach_resets_from_locked() {
        let mut s = servo(500_000.0, 1_000, 0, false);
        s.sample(10, 0);
        s.sample(10, 1_000_000_000);
        assert!(!matches!(s.sample(5, 2_000_000_000).1, ServoState::Jump));
        let (_, state) = s.sample(50_000, 3_000_000_000);
        assert_eq!(state, ServoState::Init);
    }

    #[test]
    fn first_step_threshold_only_applies_once() {
        let mut s = servo(500_000.0, 0, 200_000, true);
        s.sample(235_000, 0);
        let (_, state) = s.sample(225_000, 1_000_000_000);
        assert_eq!(state, ServoState::Jump);
        // After the jump, subsequent large offsets do not re-trigger the
        // (already-consumed) first-step threshold; only step_threshold
        // (disabled here) would.
        let (_, state2) = s.sample(225_000, 2_000_000_000);
        assert_eq!(state2, ServoState::Locked);
    }

    #[test]
    fn is_spike_resets_only_on_the_fourth_call() {
        let mut s = servo(500_000.0, 0, 0, false);
        let filter_cfg = FilterConfig {
            size: 3,
            max_skip: 2,
            offset_range: 100_000.0,
            ..FilterConfig::default()
        };
        s = PiServo::new(0.0, s.cfg, filter_cfg);
        s.sync_interval(1.0);
        for ts in 0..4 {
            s.sample(100, ts * 1_000_000_000);
        }
        assert!(s.is_spike(919_000));
        assert!(s.is_spike(921_000));
        assert!(s.is_spike(-921_000));
        assert!(s.is_spike(921_000));
        assert_eq!(s.count, 0);
    }

    #[test]
    fn unlock_forces_fast_profile_and_clears_filter() {
        let mut s = servo(500_000.0, 0, 0, false);
        s.sample(10, 0);
        s.sample(10, 1_000_000_000);
        assert!(!s.using_fast);
        s.unlock();
        assert!(s.using_fast);
        assert_eq!(s.count, 0);
    }
}
