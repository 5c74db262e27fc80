//! Discipline pipelines (spec §4.5): one loop body shared by every source
//! of `(offset, local_ts)` samples.
//!
//! `phc_to_phc` (cross-device sysoff sampling), `timestampsource_to_phc`
//! (PPS-derived samples) and `ptp_client` (network Sync/Follow_Up) are
//! the same [`Pipeline`] generic over a different [`Timestamper`] impl —
//! the apply-step dispatch on [`ServoState`] is the one piece of shared
//! logic the spec calls out, so it lives in [`apply_correction`] instead
//! of being copy-pasted per orchestrator.

use crate::error::Result;
use crate::servo::ServoState;
use crate::traits::{DeviceController, ServoController, Timestamper};

/// Apply whatever the servo decided: nothing during acquisition, a
/// frequency trim plus a clock step on a jump, a frequency trim alone
/// once locked. The servo's output is computed directly from the
/// measured offset (no internal sign flip), so both corrections are
/// negated before being handed to the device.
pub fn apply_correction<D: DeviceController>(
    device: &mut D,
    offset_ns: i64,
    freq_ppb: f64,
    state: ServoState,
) -> Result<()> {
    match state {
        ServoState::Init => Ok(()),
        ServoState::Jump => {
            device.adjust_frequency(-freq_ppb)?;
            device.step(-offset_ns)
        }
        ServoState::Locked => device.adjust_frequency(-freq_ppb),
    }
}

pub struct Pipeline<T, S, D> {
    source: T,
    servo: S,
    device: D,
    corrections_applied: u64,
    spikes_rejected: u64,
    last_offset_ns: i64,
    last_freq_ppb: f64,
}

impl<T, S, D> Pipeline<T, S, D>
where
    T: Timestamper,
    S: ServoController,
    D: DeviceController,
{
    pub fn new(source: T, servo: S, device: D) -> Self {
        Pipeline {
            source,
            servo,
            device,
            corrections_applied: 0,
            spikes_rejected: 0,
            last_offset_ns: 0,
            last_freq_ppb: 0.0,
        }
    }

    /// Run one iteration: pull a sample if available, filter it, feed
    /// the servo, and apply the result. Returns the resulting state, or
    /// `None` if no sample was ready or it was rejected as a spike.
    pub fn tick(&mut self) -> Result<Option<ServoState>> {
        let Some((offset_ns, local_ts)) = self.source.next_offset()? else {
            return Ok(None);
        };
        if self.servo.is_spike(offset_ns) {
            self.spikes_rejected += 1;
            return Ok(None);
        }
        let (freq_ppb, state) = self.servo.sample(offset_ns, local_ts);
        apply_correction(&mut self.device, offset_ns, freq_ppb, state)?;
        self.corrections_applied += 1;
        self.last_offset_ns = offset_ns;
        self.last_freq_ppb = freq_ppb;
        Ok(Some(state))
    }

    pub fn unlock(&mut self) {
        self.servo.unlock();
    }

    pub fn corrections_applied(&self) -> u64 {
        self.corrections_applied
    }

    pub fn spikes_rejected(&self) -> u64 {
        self.spikes_rejected
    }

    pub fn last_offset_ns(&self) -> i64 {
        self.last_offset_ns
    }

    pub fn last_freq_ppb(&self) -> f64 {
        self.last_freq_ppb
    }
}
