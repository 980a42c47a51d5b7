//! Device capability layer
//!
//! The control loop only talks to hardware through the [`Device`] trait. Every
//! call is synchronous request/response and may fail with a [`DeviceError`].

use crate::errors::DeviceError;
use std::ops::RangeInclusive;

#[cfg(feature = "nvml")]
pub mod nvml;
pub mod sim;

/// Result type for device calls
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Performance tiers a clock offset can be applied to. P15 is reserved.
pub const TIER_RANGE: RangeInclusive<u32> = 0..=14;

/// Driver library version required for manual fan control
pub const FAN_CONTROL_VERSION: &str = "11.520.56";

/// Driver library version required for per-tier clock offsets
pub const CLOCK_OFFSET_VERSION: &str = "12.555.42";

/// Clock domains the controller reads and offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    Graphics,
    Memory,
}

/// Fan control policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanPolicy {
    /// Fan speed follows explicit duty writes
    Manual,
    /// Fan speed follows the device's own temperature policy
    Automatic,
}

/// Which device to open
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum DeviceSelector {
    Index(u32),
    Uuid(String),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Index(index) => write!(f, "index {}", index),
            DeviceSelector::Uuid(uuid) => write!(f, "UUID {}", uuid),
        }
    }
}

/// Narrow capability interface over a single GPU
pub trait Device {
    fn name(&self) -> DeviceResult<String>;
    fn uuid(&self) -> DeviceResult<String>;

    /// Version string of the driver management library
    fn library_version(&self) -> DeviceResult<String>;

    /// Called once at the start of every tick, before any reads
    fn refresh(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn temperature(&self) -> DeviceResult<i32>;
    fn fan_count(&self) -> DeviceResult<u32>;
    fn fan_speed(&self, fan: u32) -> DeviceResult<u32>;
    fn set_fan_speed(&mut self, fan: u32, percent: u32) -> DeviceResult<()>;
    fn set_fan_policy(&mut self, fan: u32, policy: FanPolicy) -> DeviceResult<()>;

    fn clock(&self, domain: ClockDomain) -> DeviceResult<u32>;
    fn performance_state(&self) -> DeviceResult<u32>;

    /// Tiers this device accepts offsets for
    fn tier_range(&self) -> RangeInclusive<u32> {
        TIER_RANGE
    }

    fn set_locked_clocks(&mut self, min_mhz: u32, max_mhz: u32) -> DeviceResult<()>;
    fn reset_locked_clocks(&mut self) -> DeviceResult<()>;
    fn set_clock_offset(&mut self, domain: ClockDomain, tier: u32, offset_mhz: i32)
        -> DeviceResult<()>;

    /// Supported clocks in descending order. Graphics clocks are reported for
    /// the highest supported memory clock.
    fn supported_clocks(&self, domain: ClockDomain) -> DeviceResult<Vec<u32>>;

    /// Allowed power limit in watts as `(min, max)`
    fn power_limit_range(&self) -> DeviceResult<(u32, u32)>;
    fn default_power_limit(&self) -> DeviceResult<u32>;
    fn set_power_limit(&mut self, watts: u32) -> DeviceResult<()>;

    /// Allowed temperature threshold in celsius as `(min, max)`
    fn temperature_threshold_range(&self) -> DeviceResult<(i32, i32)>;
    fn temperature_threshold(&self) -> DeviceResult<i32>;
    fn set_temperature_threshold(&mut self, celsius: i32) -> DeviceResult<()>;

    fn persistence_mode(&self) -> DeviceResult<bool>;
    fn set_persistence_mode(&mut self, enabled: bool) -> DeviceResult<()>;
}

/// Compare dotted version strings component by component.
///
/// Missing or non-numeric components count as zero.
pub fn version_at_least(found: &str, required: &str) -> bool {
    let parse = |version: &str| -> Vec<u64> {
        version
            .trim()
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };

    let found = parse(found);
    let required = parse(required);
    let len = found.len().max(required.len());

    for i in 0..len {
        let f = found.get(i).copied().unwrap_or(0);
        let r = required.get(i).copied().unwrap_or(0);
        if f != r {
            return f > r;
        }
    }

    true
}

/// Fail with [`DeviceError::VersionTooLow`] when the device library is older than `required`
pub fn require_version<D: Device + ?Sized>(device: &D, required: &str) -> DeviceResult<()> {
    let found = device.library_version()?;
    if version_at_least(&found, required) {
        Ok(())
    } else {
        Err(DeviceError::VersionTooLow {
            found,
            required: required.to_string(),
        })
    }
}

/// Apply the same offset to every tier in `tiers`
pub fn set_tier_offsets<D: Device + ?Sized>(
    device: &mut D,
    domain: ClockDomain,
    tiers: RangeInclusive<u32>,
    offset_mhz: i32,
) -> DeviceResult<()> {
    for tier in tiers {
        device.set_clock_offset(domain, tier, offset_mhz)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_comparison() {
        assert!(version_at_least("12.555.42", "12.555.42"));
        assert!(version_at_least("12.560.35.03", "12.555.42"));
        assert!(version_at_least("13.0", "12.555.42"));
        assert!(!version_at_least("11.520.56", "12.555.42"));
        assert!(!version_at_least("12.550.120", "12.555.42"));
    }

    #[test]
    fn test_require_version_reports_both_versions() {
        let device = sim::SimulatedDevice::new().with_library_version("11.470.1");
        let err = require_version(&device, FAN_CONTROL_VERSION).unwrap_err();
        assert_eq!(
            err,
            DeviceError::VersionTooLow {
                found: "11.470.1".to_string(),
                required: FAN_CONTROL_VERSION.to_string(),
            }
        );
    }
}
