//! NVML-backed device
//!
//! NVML device handles borrow the library session, so the session is owned
//! here and the handle is looked up by index for each call.

use super::{ClockDomain, Device, DeviceResult, DeviceSelector, FanPolicy};
use crate::errors::DeviceError;
use log::debug;
use nvml_wrapper::enum_wrappers::device::{Clock, PerformanceState, TemperatureSensor};
use nvml_wrapper::enums::device::GpuLockedClocksSetting;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

impl From<NvmlError> for DeviceError {
    fn from(err: NvmlError) -> Self {
        match &err {
            NvmlError::NotSupported => DeviceError::NotSupported,
            NvmlError::NoPermission => DeviceError::NoPermission,
            NvmlError::NotFound => DeviceError::NotFound(err.to_string()),
            _ => DeviceError::Failed(err.to_string()),
        }
    }
}

fn nvml_clock(domain: ClockDomain) -> Clock {
    match domain {
        ClockDomain::Graphics => Clock::Graphics,
        ClockDomain::Memory => Clock::Memory,
    }
}

fn tier_to_pstate(tier: u32) -> DeviceResult<PerformanceState> {
    Ok(match tier {
        0 => PerformanceState::Zero,
        1 => PerformanceState::One,
        2 => PerformanceState::Two,
        3 => PerformanceState::Three,
        4 => PerformanceState::Four,
        5 => PerformanceState::Five,
        6 => PerformanceState::Six,
        7 => PerformanceState::Seven,
        8 => PerformanceState::Eight,
        9 => PerformanceState::Nine,
        10 => PerformanceState::Ten,
        11 => PerformanceState::Eleven,
        12 => PerformanceState::Twelve,
        13 => PerformanceState::Thirteen,
        14 => PerformanceState::Fourteen,
        15 => PerformanceState::Fifteen,
        other => return Err(DeviceError::Failed(format!("invalid pstate P{}", other))),
    })
}

fn pstate_to_tier(state: PerformanceState) -> DeviceResult<u32> {
    Ok(match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        PerformanceState::Unknown => {
            return Err(DeviceError::Failed("unknown performance state".to_string()))
        }
    })
}

/// A GPU reached through NVML
pub struct NvmlDevice {
    nvml: Nvml,
    index: u32,
}

impl NvmlDevice {
    /// Initialise NVML and resolve the selected device
    pub fn open(selector: &DeviceSelector) -> DeviceResult<Self> {
        let nvml = Nvml::init()?;

        let index = match selector {
            DeviceSelector::Index(index) => {
                nvml.device_by_index(*index)
                    .map_err(|_| DeviceError::NotFound(selector.to_string()))?;
                *index
            }
            DeviceSelector::Uuid(uuid) => nvml
                .device_by_uuid(uuid.as_str())
                .map_err(|_| DeviceError::NotFound(selector.to_string()))?
                .index()?,
        };

        debug!("Opened NVML device {} ({})", index, selector);
        Ok(Self { nvml, index })
    }

    fn handle(&self) -> DeviceResult<nvml_wrapper::Device<'_>> {
        Ok(self.nvml.device_by_index(self.index)?)
    }
}

impl Device for NvmlDevice {
    fn name(&self) -> DeviceResult<String> {
        Ok(self.handle()?.name()?)
    }

    fn uuid(&self) -> DeviceResult<String> {
        Ok(self.handle()?.uuid()?)
    }

    fn library_version(&self) -> DeviceResult<String> {
        Ok(self.nvml.sys_nvml_version()?)
    }

    fn temperature(&self) -> DeviceResult<i32> {
        Ok(self.handle()?.temperature(TemperatureSensor::Gpu)? as i32)
    }

    fn fan_count(&self) -> DeviceResult<u32> {
        Ok(self.handle()?.num_fans()?)
    }

    fn fan_speed(&self, fan: u32) -> DeviceResult<u32> {
        Ok(self.handle()?.fan_speed(fan)?)
    }

    fn set_fan_speed(&mut self, fan: u32, percent: u32) -> DeviceResult<()> {
        // Setting a speed switches the fan to manual policy on its own
        Ok(self.handle()?.set_fan_speed(fan, percent)?)
    }

    fn set_fan_policy(&mut self, fan: u32, policy: FanPolicy) -> DeviceResult<()> {
        match policy {
            FanPolicy::Automatic => Ok(self.handle()?.set_default_fan_speed(fan)?),
            FanPolicy::Manual => {
                let current = self.handle()?.fan_speed(fan)?;
                Ok(self.handle()?.set_fan_speed(fan, current)?)
            }
        }
    }

    fn clock(&self, domain: ClockDomain) -> DeviceResult<u32> {
        Ok(self.handle()?.clock_info(nvml_clock(domain))?)
    }

    fn performance_state(&self) -> DeviceResult<u32> {
        pstate_to_tier(self.handle()?.performance_state()?)
    }

    fn set_locked_clocks(&mut self, min_mhz: u32, max_mhz: u32) -> DeviceResult<()> {
        Ok(self
            .handle()?
            .set_gpu_locked_clocks(GpuLockedClocksSetting::Numeric {
                min_clock_mhz: min_mhz,
                max_clock_mhz: max_mhz,
            })?)
    }

    fn reset_locked_clocks(&mut self) -> DeviceResult<()> {
        Ok(self.handle()?.reset_gpu_locked_clocks()?)
    }

    fn set_clock_offset(
        &mut self,
        domain: ClockDomain,
        tier: u32,
        offset_mhz: i32,
    ) -> DeviceResult<()> {
        let pstate = tier_to_pstate(tier)?;
        Ok(self
            .handle()?
            .set_clock_offset(nvml_clock(domain), pstate, offset_mhz)?)
    }

    fn supported_clocks(&self, domain: ClockDomain) -> DeviceResult<Vec<u32>> {
        let device = self.handle()?;
        let mut memory = device.supported_memory_clocks()?;
        memory.sort_unstable_by(|a, b| b.cmp(a));

        let mut clocks = match domain {
            ClockDomain::Memory => memory,
            ClockDomain::Graphics => {
                let highest = memory.first().copied().ok_or(DeviceError::NotSupported)?;
                device.supported_graphics_clocks(highest)?
            }
        };
        clocks.sort_unstable_by(|a, b| b.cmp(a));
        Ok(clocks)
    }

    fn power_limit_range(&self) -> DeviceResult<(u32, u32)> {
        let constraints = self.handle()?.power_management_limit_constraints()?;
        Ok((constraints.min_limit / 1000, constraints.max_limit / 1000))
    }

    fn default_power_limit(&self) -> DeviceResult<u32> {
        Ok(self.handle()?.power_management_limit_default()? / 1000)
    }

    fn set_power_limit(&mut self, watts: u32) -> DeviceResult<()> {
        Ok(self.handle()?.set_power_management_limit(watts * 1000)?)
    }

    // nvml-wrapper has no acoustic threshold variants or threshold setter
    fn temperature_threshold_range(&self) -> DeviceResult<(i32, i32)> {
        Err(DeviceError::NotSupported)
    }

    fn temperature_threshold(&self) -> DeviceResult<i32> {
        Err(DeviceError::NotSupported)
    }

    fn set_temperature_threshold(&mut self, _celsius: i32) -> DeviceResult<()> {
        Err(DeviceError::NotSupported)
    }

    fn persistence_mode(&self) -> DeviceResult<bool> {
        Ok(self.handle()?.is_in_persistent_mode()?)
    }

    fn set_persistence_mode(&mut self, enabled: bool) -> DeviceResult<()> {
        Ok(self.handle()?.set_persistent(enabled)?)
    }
}
