//! GPU Curve Controller
//!
//! Drives an NVIDIA GPU's fans from a temperature curve with down-only
//! hysteresis, and undervolts it by locking the core clock into a window
//! with a per-pstate clock offset while the card is under load.

pub mod args;
pub mod config;
pub mod daemon;
pub mod device;
pub mod errors;
pub mod fan;
pub mod fan_control;
pub mod guard;
pub mod hysteresis;
pub mod logging;
pub mod undervolt;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use device::{ClockDomain, Device, DeviceSelector, FanPolicy};
pub use errors::{ConfigError, DeviceError, GpuCurveError, Result};
pub use fan::{FanCurve, FanPoint};
