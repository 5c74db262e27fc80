//! Thin, typed wrappers over the kernel's `clock_adjtime` facility.
//!
//! Every operation here is a pure side-effecting leaf: it knows nothing
//! about PHC devices or servos, only about an opaque clock id and the
//! kernel ABI. [`PhcHandle`](crate::phc::PhcHandle) and the system clock
//! both funnel through this module.

use crate::error::{PtpdiscError, Result};
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// PPB → kernel scaled-ppm conversion constant (65536 units per ppm,
/// ppm = ppb / 1000).
const PPB_TO_SCALED_PPM: f64 = 65.536;

pub const TIME_OK: i32 = 0;

/// An opaque clock identifier. For a PHC device this is derived from the
/// owning file descriptor via `FD_TO_CLOCKID`; for the system clock it is
/// `CLOCK_REALTIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockId(libc::clockid_t);

impl ClockId {
    pub const REALTIME: ClockId = ClockId(libc::CLOCK_REALTIME);

    /// `(~fd << 3) | 3`, the standard dynamic-clockid encoding the kernel
    /// uses to let `clock_gettime`/`clock_adjtime` address a PHC fd.
    pub fn from_fd(fd: RawFd) -> ClockId {
        ClockId(((!fd) << 3) | 3)
    }

    pub fn raw(self) -> libc::clockid_t {
        self.0
    }
}

fn check_status(op: &'static str, status: libc::c_int, clock_desc: &str) -> Result<i32> {
    if status < 0 {
        return Err(PtpdiscError::device(
            clock_desc,
            format!("{op} failed: {}", std::io::Error::last_os_error()),
        ));
    }
    if status != TIME_OK {
        return Err(PtpdiscError::clock_state(op, status, clock_desc));
    }
    Ok(status)
}

/// Read the current frequency offset of `clock`, in PPB relative to the
/// clock's natural rate.
pub fn freq_ppb(clock: ClockId, clock_desc: &str) -> Result<f64> {
    let mut tx: libc::timex = unsafe { mem::zeroed() };
    tx.modes = 0;
    let ret = unsafe { libc::clock_adjtime(clock.raw(), &mut tx) };
    check_status("freq_ppb", ret, clock_desc)?;
    Ok(tx.freq as f64 / PPB_TO_SCALED_PPM)
}

/// Set the frequency offset of `clock`, in PPB.
pub fn adj_freq(clock: ClockId, ppb: f64, clock_desc: &str) -> Result<()> {
    let mut tx: libc::timex = unsafe { mem::zeroed() };
    tx.modes = libc::ADJ_FREQUENCY;
    tx.freq = (ppb * PPB_TO_SCALED_PPM).round() as i64;
    let ret = unsafe { libc::clock_adjtime(clock.raw(), &mut tx) };
    check_status("adj_freq", ret, clock_desc)?;
    Ok(())
}

/// Step `clock` by `offset`, in the direction of `sign` (>=0 forward,
/// negative backward). Uses `ADJ_SETOFFSET | ADJ_NANO`, which applies a
/// relative offset directly and works uniformly for `CLOCK_REALTIME` and
/// PHC clock ids.
pub fn step(clock: ClockId, offset: Duration, sign: i64, clock_desc: &str) -> Result<()> {
    let mut tx: libc::timex = unsafe { mem::zeroed() };
    tx.modes = libc::ADJ_SETOFFSET | libc::ADJ_NANO;

    let mut secs = offset.as_secs() as i64;
    let mut nanos = offset.subsec_nanos() as i64;
    if sign < 0 {
        secs = -secs;
        nanos = -nanos;
    }
    // Normalize so 0 <= nanos < 1e9, matching the unit_base=1e9 invariant
    // for the ADJ_NANO backend.
    if nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    tx.time.tv_sec = secs as libc::time_t;
    tx.time.tv_usec = nanos as libc::suseconds_t;

    let ret = unsafe { libc::clock_adjtime(clock.raw(), &mut tx) };
    check_status("step", ret, clock_desc)?;
    Ok(())
}

/// Set the absolute time of `clock`.
pub fn set_time(clock: ClockId, secs: i64, nanos: u32, clock_desc: &str) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as i64,
    };
    let ret = unsafe { libc::clock_settime(clock.raw(), &ts) };
    if ret < 0 {
        return Err(PtpdiscError::device(
            clock_desc,
            format!("set_time failed: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(())
}

/// Read the clock's discipline-status word without modifying anything.
pub fn read_status(clock: ClockId, clock_desc: &str) -> Result<i32> {
    let mut tx: libc::timex = unsafe { mem::zeroed() };
    tx.modes = 0;
    let ret = unsafe { libc::clock_adjtime(clock.raw(), &mut tx) };
    if ret < 0 {
        return Err(PtpdiscError::device(
            clock_desc,
            format!("read_status failed: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(ret)
}

/// Read the current time of `clock` as (seconds, nanoseconds).
pub fn gettime(clock: ClockId, clock_desc: &str) -> Result<(i64, u32)> {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clock.raw(), &mut ts) };
    if ret < 0 {
        return Err(PtpdiscError::device(
            clock_desc,
            format!("gettime failed: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok((ts.tv_sec as i64, ts.tv_nsec as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppb_to_scaled_ppm_is_bit_exact_modulo_truncation() {
        // 65.536 exactly; round-trip for a value representable without
        // fractional loss.
        let ppb = 1000.0; // 1 ppm
        let scaled = (ppb * PPB_TO_SCALED_PPM).round() as i64;
        assert_eq!(scaled, 65536);
        let back = scaled as f64 / PPB_TO_SCALED_PPM;
        assert!((back - ppb).abs() < 1e-6);
    }

    #[test]
    fn from_fd_matches_dynamic_clockid_encoding() {
        let fd: RawFd = 3;
        let cid = ClockId::from_fd(fd);
        assert_eq!(cid.raw(), ((!fd) << 3) | 3);
    }

    #[test]
    fn step_normalizes_negative_nanos() {
        // Mirrors the normalization logic in `step` without touching the
        // kernel: construct the same tv_sec/tv_usec a -1.5s step would
        // produce and confirm 0 <= nanos < 1e9.
        let offset = Duration::new(1, 500_000_000);
        let sign = -1i64;
        let mut secs = offset.as_secs() as i64;
        let mut nanos = offset.subsec_nanos() as i64;
        if sign < 0 {
            secs = -secs;
            nanos = -nanos;
        }
        if nanos < 0 {
            secs -= 1;
            nanos += 1_000_000_000;
        }
        assert_eq!(secs, -2);
        assert_eq!(nanos, 500_000_000);
    }
}
