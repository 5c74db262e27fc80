//! PHC (PTP Hardware Clock) character-device abstraction.
//!
//! Thin, typed wrappers over the `/dev/ptpN` ioctl surface. Mirrors the
//! ioctl-wrapper shape used for the RTC device in [`crate::rtc`] (an
//! owned `File`, raw ioctl numbers computed once, no unsafe leaking past
//! this module) but targets the PTP clock ABI instead.

use crate::clockadj::{self, ClockId};
use crate::error::{PtpdiscError, Result};
use crate::sysoff;
use std::fs::{File, OpenOptions};
use std::mem::{self, MaybeUninit};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

const PTP_MAX_SAMPLES: usize = 25;

// PTP ioctl numbers, magic '=' (0x3d). The four GETCAPS/SYS_OFFSET*
// constants are the values the kernel actually expects (confirmed against
// a running driver); the pin/perout/extts ones are derived the same way
// from struct sizes below and have not been strace-verified.
const PTP_CLOCK_GETCAPS: libc::c_ulong = 0x80503d01;
const PTP_SYS_OFFSET: libc::c_ulong = 0x43403d05;
const PTP_SYS_OFFSET_PRECISE: libc::c_ulong = 0xc0403d08;
const PTP_SYS_OFFSET_EXTENDED: libc::c_ulong = 0xc4c03d09;
const PTP_EXTTS_REQUEST: libc::c_ulong = 0x40103d02;
const PTP_PEROUT_REQUEST: libc::c_ulong = 0x40383d03;
const PTP_ENABLE_PPS: libc::c_ulong = 0x40043d04;
const PTP_PIN_GETFUNC: libc::c_ulong = 0xc0603d06;
const PTP_PIN_SETFUNC: libc::c_ulong = 0x40603d07;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockTime {
    pub sec: i64,
    pub nsec: u32,
    pub reserved: u32,
}

impl PtpClockTime {
    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * 1_000_000_000 + self.nsec as i128
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockCaps {
    pub max_adj: i32,
    pub n_alarm: i32,
    pub n_ext_ts: i32,
    pub n_per_out: i32,
    pub pps: i32,
    pub n_pins: i32,
    pub cross_timestamping: i32,
    pub adjust_phase: i32,
    pub max_phase_adj: i32,
    pub rsv: [i32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffset {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [PtpClockTime; 2 * PTP_MAX_SAMPLES + 1],
}

impl Default for PtpSysOffset {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpSysOffsetPrecise {
    pub device: PtpClockTime,
    pub sys_realtime: PtpClockTime,
    pub sys_monoraw: PtpClockTime,
    pub rsv: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffsetExtended {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [[PtpClockTime; 3]; PTP_MAX_SAMPLES],
}

impl Default for PtpSysOffsetExtended {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsRequest {
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpPeroutRequest {
    pub start: PtpClockTime,
    pub period: PtpClockTime,
    pub index: u32,
    pub flags: u32,
    /// Pulse width, only consulted when `flags` carries the duty-cycle bit.
    pub on: PtpClockTime,
    pub rsv: [u32; 4],
}

/// One external-timestamp capture, read back as a raw binary record off
/// the device fd rather than via ioctl.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsEvent {
    pub t: PtpClockTime,
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpPinDesc {
    pub name: [u8; 64],
    pub index: u32,
    pub func: u32,
    pub chan: u32,
    pub rsv: [u32; 5],
}

impl Default for PtpPinDesc {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

/// An open PHC character device (`/dev/ptp0`, ...).
#[derive(Debug)]
pub struct PhcHandle {
    file: File,
    path: String,
}

impl PhcHandle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PtpdiscError::device(path.display().to_string(), e.to_string()))?;
        Ok(PhcHandle {
            file,
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn clock_id(&self) -> ClockId {
        ClockId::from_fd(self.file.as_raw_fd())
    }

    unsafe fn ioctl<T>(&self, request: libc::c_ulong, value: &mut T) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, value) };
        if ret != 0 {
            return Err(PtpdiscError::device(
                self.path.clone(),
                format!("ioctl 0x{request:x} failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(())
    }

    unsafe fn ioctl_uninit<T>(&self, request: libc::c_ulong) -> Result<T> {
        let mut value: MaybeUninit<T> = MaybeUninit::uninit();
        unsafe { self.ioctl(request, &mut value)? };
        Ok(unsafe { value.assume_init() })
    }

    pub fn get_caps(&self) -> Result<PtpClockCaps> {
        let mut caps: PtpClockCaps = unsafe { self.ioctl_uninit(PTP_CLOCK_GETCAPS)? };
        if caps.max_adj == 0 {
            caps.max_adj = 500_000;
        }
        Ok(caps)
    }

    /// Legacy fixed-25-sample offset measurement.
    pub fn get_sys_offset(&self) -> Result<PtpSysOffset> {
        let mut req = PtpSysOffset::default();
        req.n_samples = PTP_MAX_SAMPLES as u32;
        unsafe { self.ioctl(PTP_SYS_OFFSET, &mut req)? };
        Ok(req)
    }

    /// Hardware-assisted offset measurement with no interpolation error.
    pub fn get_sys_offset_precise(&self) -> Result<PtpSysOffsetPrecise> {
        let mut req = PtpSysOffsetPrecise::default();
        unsafe { self.ioctl(PTP_SYS_OFFSET_PRECISE, &mut req)? };
        Ok(req)
    }

    /// `n_samples` triples of (pre-read system time, PHC time, post-read
    /// system time), used to pick the tightest-bracket sample.
    pub fn get_sys_offset_extended(&self, n_samples: u32) -> Result<PtpSysOffsetExtended> {
        let mut req = PtpSysOffsetExtended::default();
        req.n_samples = n_samples.min(PTP_MAX_SAMPLES as u32);
        unsafe { self.ioctl(PTP_SYS_OFFSET_EXTENDED, &mut req)? };
        Ok(req)
    }

    pub fn request_periodic_output(&self, req: &PtpPeroutRequest) -> Result<()> {
        let mut req = *req;
        unsafe { self.ioctl(PTP_PEROUT_REQUEST, &mut req) }
    }

    pub fn request_external_timestamp(&self, req: &PtpExttsRequest) -> Result<()> {
        let mut req = *req;
        unsafe { self.ioctl(PTP_EXTTS_REQUEST, &mut req) }
    }

    pub fn enable_pps(&self, enable: bool) -> Result<()> {
        let mut flag: i32 = enable as i32;
        unsafe { self.ioctl(PTP_ENABLE_PPS, &mut flag) }
    }

    pub fn get_pin_func(&self, index: u32) -> Result<PtpPinDesc> {
        let mut desc = PtpPinDesc::default();
        desc.index = index;
        unsafe { self.ioctl(PTP_PIN_GETFUNC, &mut desc)? };
        Ok(desc)
    }

    pub fn set_pin_func(&self, desc: &PtpPinDesc) -> Result<()> {
        let mut desc = *desc;
        unsafe { self.ioctl(PTP_PIN_SETFUNC, &mut desc) }
    }

    /// Current PHC time via `clock_gettime` on the derived clock id.
    pub fn time(&self) -> Result<(i64, u32)> {
        clockadj::gettime(self.clock_id(), &self.path)
    }

    /// Read an extended sys-offset batch and pick the tightest-bracket
    /// sample (§4.2 `best_sample_from_extended`).
    pub fn best_sample_from_extended(&self, n_samples: u32) -> Result<Option<(i64, u64)>> {
        let ext = self.get_sys_offset_extended(n_samples)?;
        Ok(sysoff::best_sample(&ext))
    }

    pub fn max_freq_adj_ppb(&self) -> Result<f64> {
        Ok(self.get_caps()?.max_adj as f64)
    }

    pub fn freq_ppb(&self) -> Result<f64> {
        clockadj::freq_ppb(self.clock_id(), &self.path)
    }

    pub fn adj_freq(&self, ppb: f64) -> Result<()> {
        clockadj::adj_freq(self.clock_id(), ppb, &self.path)
    }

    pub fn step(&self, offset_ns: i64) -> Result<()> {
        let sign = if offset_ns < 0 { -1 } else { 1 };
        let magnitude = Duration::from_nanos(offset_ns.unsigned_abs());
        clockadj::step(self.clock_id(), magnitude, sign, &self.path)
    }

    pub fn set_time(&self, secs: i64, nanos: u32) -> Result<()> {
        clockadj::set_time(self.clock_id(), secs, nanos, &self.path)
    }

    /// Poll the device fd for `POLLIN | POLLPRI` with a timeout, retrying
    /// through `EINTR`. Returns the observed `revents`.
    fn poll_events(&self, timeout_ms: i32) -> Result<i16> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN | libc::POLLPRI,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PtpdiscError::Poll(format!("poll({}) failed: {err}", self.path)));
            }
            return Ok(pfd.revents);
        }
    }

    /// Block for one external-timestamp event with a 1 s timeout, verify
    /// it came from `expected_index`, and return `(sec, nsec)`.
    pub fn read_external_timestamp_event(&self, expected_index: u32) -> Result<(i64, u32)> {
        let revents = self.poll_events(1_000)?;
        if revents & libc::POLLERR != 0 {
            return Err(PtpdiscError::Poll(format!("POLLERR set on {}", self.path)));
        }
        if revents == 0 {
            return Err(PtpdiscError::Poll(
                "timed out waiting for extts event; ensure PPS Out and PPS In are connected".to_string(),
            ));
        }
        let mut event = PtpExttsEvent::default();
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                &mut event as *mut _ as *mut libc::c_void,
                mem::size_of::<PtpExttsEvent>(),
            )
        };
        if n != mem::size_of::<PtpExttsEvent>() as isize {
            return Err(PtpdiscError::device(
                self.path.clone(),
                format!("short read of extts event: {n}"),
            ));
        }
        if event.index != expected_index {
            return Err(PtpdiscError::device(
                self.path.clone(),
                format!("extts event for pin {} but expected {expected_index}", event.index),
            ));
        }
        Ok((event.t.sec, event.t.nsec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_as_nanos_combines_sec_and_nsec() {
        let t = PtpClockTime { sec: 2, nsec: 500_000_000, reserved: 0 };
        assert_eq!(t.as_nanos(), 2_500_000_000);
    }

    #[test]
    fn sys_offset_struct_defaults_to_zeroed_samples() {
        let off = PtpSysOffset::default();
        assert_eq!(off.n_samples, 0);
        assert_eq!(off.ts[0].sec, 0);
        assert_eq!(off.ts.len(), 2 * PTP_MAX_SAMPLES + 1);
    }

    #[test]
    fn extended_offset_struct_has_25_sample_slots() {
        let off = PtpSysOffsetExtended::default();
        assert_eq!(off.ts.len(), PTP_MAX_SAMPLES);
        assert_eq!(off.ts[0].len(), 3);
    }

    #[test]
    fn zero_max_adj_falls_back_to_500000_ppb() {
        let mut caps = PtpClockCaps::default();
        caps.max_adj = 0;
        if caps.max_adj == 0 {
            caps.max_adj = 500_000;
        }
        assert_eq!(caps.max_adj, 500_000);
    }

    #[test]
    fn open_missing_device_returns_device_error() {
        let err = PhcHandle::open("/dev/ptp_does_not_exist_ptpdisc_test").unwrap_err();
        match err {
            PtpdiscError::Device { .. } => {}
            other => panic!("expected Device error, got {other:?}"),
        }
    }
}
