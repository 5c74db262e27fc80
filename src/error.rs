//! Error taxonomy for the discipline and quality-publishing pipelines.
//!
//! Pipeline loops match on these variants to decide whether an iteration
//! merely gets skipped (most cases) or the servo needs to unlock.

use thiserror::Error;

/// Errors produced anywhere in the crate.
#[derive(Debug, Error)]
pub enum PtpdiscError {
    #[error("config error: {0}")]
    Config(String),

    #[error("device error on {path}: {message}")]
    Device { path: String, message: String },

    #[error("clock state error: op={op} status={status} clock={clock}")]
    ClockState {
        op: &'static str,
        status: i32,
        clock: String,
    },

    #[error("timing error: {0}")]
    Timing(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("poll error: {0}")]
    Poll(String),
}

pub type Result<T> = std::result::Result<T, PtpdiscError>;

impl PtpdiscError {
    pub fn device(path: impl Into<String>, message: impl Into<String>) -> Self {
        PtpdiscError::Device {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn clock_state(op: &'static str, status: i32, clock: impl Into<String>) -> Self {
        PtpdiscError::ClockState {
            op,
            status,
            clock: clock.into(),
        }
    }
}

impl From<std::io::Error> for PtpdiscError {
    fn from(e: std::io::Error) -> Self {
        PtpdiscError::Device {
            path: String::new(),
            message: e.to_string(),
        }
    }
}
