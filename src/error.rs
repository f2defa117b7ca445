//! Error taxonomy shared by every component.

use std::time::Duration;

use crate::driver::DriverError;
use crate::registry::RuntimeStatus;

pub type Result<T> = std::result::Result<T, RunboxError>;

#[derive(Debug, thiserror::Error)]
pub enum RunboxError {
    #[error("port pool exhausted: every port in {start}..={end} is allocated")]
    PortPoolExhausted { start: u16, end: u16 },

    #[error("runtime driver unavailable: {message}")]
    DriverUnavailable { message: String, rolled_back: bool },

    #[error("failed to create runtime for tenant {tenant} during {stage}: {message}")]
    RuntimeCreateFailed {
        tenant: String,
        stage: &'static str,
        message: String,
    },

    #[error("no runtime for tenant {0}")]
    RuntimeNotFound(String),

    #[error("runtime for tenant {tenant} is {status}, not running")]
    RuntimeNotRunning { tenant: String, status: RuntimeStatus },

    #[error("command timed out after {}ms: {command}", timeout.as_millis())]
    CommandTimeout { command: String, timeout: Duration },

    #[error("command exited with code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("driver {op} failed: {message}")]
    Driver { op: &'static str, message: String },

    #[error("project store: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RunboxError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PortPoolExhausted { .. } => "port_pool_exhausted",
            Self::DriverUnavailable { .. } => "driver_unavailable",
            Self::RuntimeCreateFailed { .. } => "runtime_create_failed",
            Self::RuntimeNotFound(_) => "runtime_not_found",
            Self::RuntimeNotRunning { .. } => "runtime_not_running",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::CommandFailed { .. } => "command_failed",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Driver { .. } => "driver_error",
            Self::Store(_) => "store_error",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }

    /// True when the failed operation had partially changed state and that
    /// change was undone. False means state was never touched.
    pub fn rolled_back(&self) -> bool {
        match self {
            Self::RuntimeCreateFailed { .. } => true,
            Self::DriverUnavailable { rolled_back, .. } => *rolled_back,
            _ => false,
        }
    }

    pub(crate) fn from_driver(err: DriverError) -> Self {
        match err {
            DriverError::Unavailable(message) => Self::DriverUnavailable {
                message,
                rolled_back: false,
            },
            DriverError::Failed { op, message } => Self::Driver { op, message },
            DriverError::Timeout { op, after } => Self::Driver {
                op,
                message: format!("timed out after {}ms", after.as_millis()),
            },
        }
    }
}

impl From<DriverError> for RunboxError {
    fn from(err: DriverError) -> Self {
        Self::from_driver(err)
    }
}
