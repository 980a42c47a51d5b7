//! Error types for the GPU curve controller

use thiserror::Error;

/// Result type alias for the GPU curve controller
pub type Result<T> = std::result::Result<T, GpuCurveError>;

/// Main error type for the GPU curve controller
#[derive(Error, Debug)]
pub enum GpuCurveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Problems found while resolving or validating the configuration.
///
/// All of these are raised before the device is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Curve must contain at least one point in the format 'temperature:speed,...'")]
    EmptyCurve,

    #[error("Invalid curve point '{0}', expected 'temperature:speed'")]
    MalformedPoint(String),

    #[error("Fan speed {duty}% at {temp}C is outside 0-100")]
    DutyOutOfRange { temp: i32, duty: i32 },

    #[error("Sleep time must be bigger than 0")]
    NonPositiveInterval,

    #[error("Invalid PSTATEs: {ceiling} is outside {min}-{max}")]
    InvalidTiers { ceiling: u32, min: u32, max: u32 },

    #[error("Target clock is not set")]
    MissingTargetClock,

    #[error("Transition clock is not set")]
    MissingTransitionClock,

    #[error("Target clock must be bigger than transition clock by more than 50")]
    ClockWindowTooNarrow,

    #[error("Core offset is not set")]
    MissingCoreOffset,

    #[error("Curve increment must not be lower than doubled clock step ({0})")]
    CurveIncrementTooSmall(u32),

    #[error("{name} must be in range {min} - {max}")]
    LimitOutOfRange { name: &'static str, min: i64, max: i64 },

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid line in env file: '{0}'")]
    InvalidEnvLine(String),

    #[error("Nothing to control: set a fan curve and/or clock settings")]
    NothingToControl,
}

/// Failures reported by the device capability layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Operation not supported by this device")]
    NotSupported,

    #[error("Insufficient permissions to control the device")]
    NoPermission,

    #[error("You need at least NVML version {required} (found {found})")]
    VersionTooLow { found: String, required: String },

    #[error("Device call failed: {0}")]
    Failed(String),
}
