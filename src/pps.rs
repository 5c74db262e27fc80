//! PPS (pulse-per-second) source/sink lifecycle (spec §4.4).
//!
//! A PPS source is a PHC device configured to emit a periodic signal on
//! one of its pins; a PPS sink is a PHC device configured to timestamp
//! an external pulse on an extts-capable pin. Both ride the same
//! [`crate::phc::PhcHandle`] ioctls, so this module only manages the
//! request/cancel lifecycle and leaves measurement to [`crate::sysoff`].

use crate::error::{PtpdiscError, Result};
use crate::phc::{PhcHandle, PtpExttsRequest, PtpPeroutRequest, PtpClockTime};
use crate::servo::ServoState;
use crate::traits::{DeviceController, ServoController};

const PTP_PEROUT_ENABLE: u32 = 1 << 0;
const PTP_PEROUT_DUTY_CYCLE: u32 = 1 << 1;
const PTP_EXTTS_ENABLE: u32 = 1 << 0;
const PTP_EXTTS_RISING_EDGE: u32 = 1 << 1;

/// Default lead time, in seconds, before the first perout edge so the
/// request lands comfortably ahead of the PHC's current time.
const DEFAULT_START_DELAY_SEC: i64 = 2;
const ONE_SECOND_NS: u32 = 1_000_000_000;
const DEFAULT_ON_NS: u32 = 500_000_000;

pub struct PpsSource<'a> {
    phc: &'a PhcHandle,
    pin_index: u32,
    channel: u32,
    perout_phase_ns: i64,
    active: bool,
}

impl<'a> PpsSource<'a> {
    pub fn new(phc: &'a PhcHandle, pin_index: u32, channel: u32) -> Self {
        PpsSource { phc, pin_index, channel, perout_phase_ns: 0, active: false }
    }

    pub fn with_perout_phase(mut self, perout_phase_ns: i64) -> Self {
        self.perout_phase_ns = perout_phase_ns;
        self
    }

    /// Arm a 1 Hz periodic output starting `start_delay_sec` from now
    /// (default 2s). Tries with the duty-cycle flag (explicit 500ms pulse
    /// width) first; on kernel refusal, retries once with the flag
    /// cleared. A second failure is reported as-is (fatal, per §4.4).
    pub fn start(&mut self, start_delay_sec: Option<i64>) -> Result<()> {
        let (now_sec, _) = self.phc.time()?;
        let start_sec = now_sec + start_delay_sec.unwrap_or(DEFAULT_START_DELAY_SEC);
        let period = PtpClockTime { sec: 1, nsec: 0, reserved: 0 };
        let start = PtpClockTime { sec: start_sec, nsec: 0, reserved: 0 };

        let with_duty_cycle = PtpPeroutRequest {
            start,
            period,
            index: self.channel,
            flags: PTP_PEROUT_ENABLE | PTP_PEROUT_DUTY_CYCLE,
            on: PtpClockTime { sec: 0, nsec: DEFAULT_ON_NS, reserved: 0 },
            rsv: [0; 4],
        };
        if self.phc.request_periodic_output(&with_duty_cycle).is_ok() {
            self.active = true;
            return Ok(());
        }

        let without_duty_cycle = PtpPeroutRequest {
            start,
            period,
            index: self.channel,
            flags: PTP_PEROUT_ENABLE,
            on: PtpClockTime::default(),
            rsv: [0; 4],
        };
        self.phc.request_periodic_output(&without_duty_cycle)?;
        self.active = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let req = PtpPeroutRequest {
            start: PtpClockTime::default(),
            period: PtpClockTime::default(),
            index: self.channel,
            flags: 0,
            on: PtpClockTime::default(),
            rsv: [0; 4],
        };
        self.phc.request_periodic_output(&req)?;
        self.active = false;
        Ok(())
    }

    pub fn pin_index(&self) -> u32 {
        self.pin_index
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current PHC time, referenced to the most recent whole-second edge
    /// relative to the configured perout phase (§4.4 "Source timestamp
    /// retrieval").
    pub fn current_edge_timestamp(&self) -> Result<(i64, u32)> {
        let (sec, nsec) = self.phc.time()?;
        let now_ns = sec as i128 * 1_000_000_000 + nsec as i128;
        let phased = truncate_to_phase(now_ns, self.perout_phase_ns as i128);
        Ok(((phased / 1_000_000_000) as i64, (phased.rem_euclid(1_000_000_000)) as u32))
    }
}

/// Subtract `phase`, truncate the nanosecond field to zero, and add
/// `phase` back -- the most recent whole-second edge relative to the
/// perout epoch.
fn truncate_to_phase(total_ns: i128, phase_ns: i128) -> i128 {
    let shifted = total_ns - phase_ns;
    let floor_sec = shifted.div_euclid(1_000_000_000);
    floor_sec * 1_000_000_000 + phase_ns
}

impl Drop for PpsSource<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.stop();
        }
    }
}

pub struct PpsSink<'a> {
    phc: &'a PhcHandle,
    channel: u32,
    armed: bool,
}

impl<'a> PpsSink<'a> {
    pub fn new(phc: &'a PhcHandle, channel: u32) -> Self {
        PpsSink { phc, channel, armed: false }
    }

    pub fn arm(&mut self) -> Result<()> {
        let req = PtpExttsRequest {
            index: self.channel,
            flags: PTP_EXTTS_ENABLE | PTP_EXTTS_RISING_EDGE,
            rsv: [0; 2],
        };
        self.phc.request_external_timestamp(&req)?;
        self.armed = true;
        Ok(())
    }

    pub fn disarm(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        let req = PtpExttsRequest { index: self.channel, flags: 0, rsv: [0; 2] };
        self.phc.request_external_timestamp(&req)?;
        self.armed = false;
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Block for the next edge on this sink's pin (§4.4 "Edge polling").
    pub fn read_event(&self) -> Result<(i64, u32)> {
        self.phc.read_external_timestamp_event(self.channel)
    }
}

impl Drop for PpsSink<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.disarm();
        }
    }
}

/// One PPS synchronization step (§4.4 "Synchronization step"): given a
/// source edge timestamp and the matching sink capture, discipline the
/// destination clock through `servo` and `device`.
///
/// `now_ns` is the destination's own current time, used to reject a sink
/// timestamp that is implausibly stale.
pub fn sync_step<S: ServoController, D: DeviceController>(
    src_ts_ns: i64,
    dst_ts_ns: i64,
    now_ns: i64,
    servo: &mut S,
    device: &mut D,
) -> Result<ServoState> {
    let phc_offset = dst_ts_ns - src_ts_ns;

    if (now_ns - dst_ts_ns).abs() > ONE_SECOND_NS as i64 {
        return Err(PtpdiscError::Timing(format!(
            "pps sink timestamp {dst_ts_ns} is stale relative to now {now_ns}"
        )));
    }

    let (freq, state) = servo.sample(phc_offset, dst_ts_ns as u64);
    match state {
        ServoState::Jump => {
            if let Err(e) = device.adjust_frequency(-freq).and_then(|_| device.step(-phc_offset)) {
                servo.unlock();
                return Err(e);
            }
        }
        ServoState::Locked => {
            if let Err(e) = device.adjust_frequency(-freq) {
                servo.unlock();
                return Err(e);
            }
        }
        ServoState::Init => {}
    }
    Ok(state)
}
