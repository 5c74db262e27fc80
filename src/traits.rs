//! Capability traits at the pipeline/hardware seam.
//!
//! Pipelines ([`crate::pipeline::Pipeline`]) are generic over these
//! instead of talking to [`crate::phc::PhcHandle`] directly, the same
//! seam the Dante-era build cut between its controller and a
//! network/NTP source so the control loop could be driven by a mock in
//! tests.

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
pub trait FrequencyGetter {
    fn freq_ppb(&self) -> Result<f64>;
}

#[cfg_attr(test, mockall::automock)]
pub trait DeviceController {
    fn adjust_frequency(&mut self, ppb: f64) -> Result<()>;
    fn step(&mut self, offset_ns: i64) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait Timestamper {
    /// Returns `(offset_ns, local_ts_ns)` for the next available
    /// measurement, or `Ok(None)` if none is ready yet.
    fn next_offset(&mut self) -> Result<Option<(i64, u64)>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait PpsPoller {
    /// Returns the most recent captured pulse timestamp, in PHC
    /// nanoseconds, if a new one has arrived since the last poll.
    fn poll_pulse(&mut self) -> Result<Option<u64>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ServoController {
    fn sample(&mut self, offset_ns: i64, local_ts: u64) -> (f64, crate::servo::ServoState);
    fn is_spike(&mut self, offset_ns: i64) -> bool;
    fn unlock(&mut self);
}
