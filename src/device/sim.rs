//! Simulated GPU
//!
//! Stands in for real hardware when running with `--simulate` and in tests.
//! Every mutating call is recorded as a [`Command`] so callers can inspect
//! exactly what would have been written.

use super::{ClockDomain, Device, DeviceResult, FanPolicy};
use crate::errors::DeviceError;
use log::trace;
use rand::Rng;
use std::collections::HashMap;

/// A mutating call received by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FanSpeed { fan: u32, percent: u32 },
    FanPolicy { fan: u32, policy: FanPolicy },
    LockedClocks { min: u32, max: u32 },
    ResetLockedClocks,
    ClockOffset { domain: ClockDomain, tier: u32, offset: i32 },
    PowerLimit(u32),
    TemperatureThreshold(i32),
    PersistenceMode(bool),
}

#[derive(Debug, Clone)]
struct SimFan {
    speed: u32,
    policy: FanPolicy,
}

/// In-memory GPU with scriptable sensor readings
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    temperature: i32,
    graphics_clock: u32,
    memory_clock: u32,
    performance_state: u32,
    fans: Vec<SimFan>,
    graphics_clocks: Vec<u32>,
    memory_clocks: Vec<u32>,
    library_version: String,
    power_limit: u32,
    power_range: (u32, u32),
    default_power_limit: u32,
    threshold: Option<i32>,
    threshold_range: (i32, i32),
    persistence: Option<bool>,
    locked: Option<(u32, u32)>,
    offsets: HashMap<(ClockDomain, u32), i32>,
    commands: Vec<Command>,
    fail_reads: bool,
    wander: bool,
    read_only_limits: bool,
}

impl SimulatedDevice {
    /// Create an idle two-fan device with fixed readings
    pub fn new() -> Self {
        Self {
            temperature: 40,
            graphics_clock: 210,
            memory_clock: 405,
            performance_state: 8,
            fans: vec![
                SimFan {
                    speed: 30,
                    policy: FanPolicy::Automatic,
                };
                2
            ],
            graphics_clocks: (0..=134).map(|i| 2220 - i * 15).collect(),
            memory_clocks: vec![10501, 10251, 5001, 810, 405],
            library_version: "12.560.35".to_string(),
            power_limit: 220,
            power_range: (100, 250),
            default_power_limit: 220,
            threshold: Some(83),
            threshold_range: (60, 91),
            persistence: Some(false),
            locked: None,
            offsets: HashMap::new(),
            commands: Vec::new(),
            fail_reads: false,
            wander: false,
            read_only_limits: false,
        }
    }

    /// Create a device whose readings drift on every tick
    pub fn wandering() -> Self {
        Self {
            wander: true,
            performance_state: 0,
            graphics_clock: 1500,
            temperature: 55,
            ..Self::new()
        }
    }

    pub fn with_library_version(mut self, version: &str) -> Self {
        self.library_version = version.to_string();
        self
    }

    pub fn with_fans(mut self, count: usize) -> Self {
        self.fans = vec![
            SimFan {
                speed: 30,
                policy: FanPolicy::Automatic,
            };
            count
        ];
        self
    }

    pub fn with_supported_clocks(mut self, graphics: Vec<u32>) -> Self {
        self.graphics_clocks = graphics;
        self
    }

    pub fn with_persistence(mut self, mode: Option<bool>) -> Self {
        self.persistence = mode;
        self
    }

    pub fn with_temperature_threshold(mut self, threshold: Option<i32>) -> Self {
        self.threshold = threshold;
        self
    }

    /// Persistence mode and temperature threshold can be read but not set
    pub fn with_read_only_limits(mut self) -> Self {
        self.read_only_limits = true;
        self
    }

    pub fn set_temperature(&mut self, celsius: i32) {
        self.temperature = celsius;
    }

    pub fn set_clock(&mut self, mhz: u32) {
        self.graphics_clock = mhz;
    }

    pub fn set_performance_state(&mut self, tier: u32) {
        self.performance_state = tier;
    }

    /// Make every sensor read fail until cleared
    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn locked_clocks(&self) -> Option<(u32, u32)> {
        self.locked
    }

    pub fn offset(&self, domain: ClockDomain, tier: u32) -> i32 {
        self.offsets.get(&(domain, tier)).copied().unwrap_or(0)
    }

    pub fn fan_policy(&self, fan: u32) -> Option<FanPolicy> {
        self.fans.get(fan as usize).map(|f| f.policy)
    }

    pub fn power_limit(&self) -> u32 {
        self.power_limit
    }

    pub fn current_persistence_mode(&self) -> Option<bool> {
        self.persistence
    }

    pub fn current_temperature_threshold(&self) -> Option<i32> {
        self.threshold
    }

    fn check_read(&self) -> DeviceResult<()> {
        if self.fail_reads {
            Err(DeviceError::Failed("simulated read failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn fan_mut(&mut self, fan: u32) -> DeviceResult<&mut SimFan> {
        self.fans
            .get_mut(fan as usize)
            .ok_or_else(|| DeviceError::Failed(format!("no fan at index {}", fan)))
    }

    /// Move temperature and clock a little, pulled by fan speed and clock lock
    fn wander(&mut self) {
        let mut rng = rand::thread_rng();

        let cooling = self.fans.iter().map(|f| f.speed).max().unwrap_or(0) as i32 / 30;
        let drift = rng.gen_range(-2..=3) + 1 - cooling;
        self.temperature = (self.temperature + drift).clamp(30, 90);

        let lowest = self.graphics_clocks.last().copied().unwrap_or(0);
        let highest = self.graphics_clocks.first().copied().unwrap_or(0);
        let (lo, hi) = match self.locked {
            Some((min, max)) => (min.max(lowest), max.min(highest)),
            None => (lowest, highest),
        };
        let step = rng.gen_range(-3i64..=4) * 15;
        let clock = (self.graphics_clock as i64 + step).clamp(lo as i64, hi.max(lo) as i64);
        self.graphics_clock = clock as u32;

        trace!(
            "Simulated readings: {}C, {} MHz, P{}",
            self.temperature,
            self.graphics_clock,
            self.performance_state
        );
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SimulatedDevice {
    fn name(&self) -> DeviceResult<String> {
        Ok("Simulated GPU".to_string())
    }

    fn uuid(&self) -> DeviceResult<String> {
        Ok("GPU-00000000-0000-0000-0000-000000000000".to_string())
    }

    fn library_version(&self) -> DeviceResult<String> {
        Ok(self.library_version.clone())
    }

    fn refresh(&mut self) -> DeviceResult<()> {
        if self.wander {
            self.wander();
        }
        Ok(())
    }

    fn temperature(&self) -> DeviceResult<i32> {
        self.check_read()?;
        Ok(self.temperature)
    }

    fn fan_count(&self) -> DeviceResult<u32> {
        Ok(self.fans.len() as u32)
    }

    fn fan_speed(&self, fan: u32) -> DeviceResult<u32> {
        self.check_read()?;
        self.fans
            .get(fan as usize)
            .map(|f| f.speed)
            .ok_or_else(|| DeviceError::Failed(format!("no fan at index {}", fan)))
    }

    fn set_fan_speed(&mut self, fan: u32, percent: u32) -> DeviceResult<()> {
        let state = self.fan_mut(fan)?;
        state.speed = percent;
        state.policy = FanPolicy::Manual;
        self.commands.push(Command::FanSpeed { fan, percent });
        Ok(())
    }

    fn set_fan_policy(&mut self, fan: u32, policy: FanPolicy) -> DeviceResult<()> {
        self.fan_mut(fan)?.policy = policy;
        self.commands.push(Command::FanPolicy { fan, policy });
        Ok(())
    }

    fn clock(&self, domain: ClockDomain) -> DeviceResult<u32> {
        self.check_read()?;
        Ok(match domain {
            ClockDomain::Graphics => self.graphics_clock,
            ClockDomain::Memory => self.memory_clock,
        })
    }

    fn performance_state(&self) -> DeviceResult<u32> {
        self.check_read()?;
        Ok(self.performance_state)
    }

    fn set_locked_clocks(&mut self, min_mhz: u32, max_mhz: u32) -> DeviceResult<()> {
        self.locked = Some((min_mhz, max_mhz));
        self.commands.push(Command::LockedClocks {
            min: min_mhz,
            max: max_mhz,
        });
        Ok(())
    }

    fn reset_locked_clocks(&mut self) -> DeviceResult<()> {
        self.locked = None;
        self.commands.push(Command::ResetLockedClocks);
        Ok(())
    }

    fn set_clock_offset(
        &mut self,
        domain: ClockDomain,
        tier: u32,
        offset_mhz: i32,
    ) -> DeviceResult<()> {
        self.offsets.insert((domain, tier), offset_mhz);
        self.commands.push(Command::ClockOffset {
            domain,
            tier,
            offset: offset_mhz,
        });
        Ok(())
    }

    fn supported_clocks(&self, domain: ClockDomain) -> DeviceResult<Vec<u32>> {
        Ok(match domain {
            ClockDomain::Graphics => self.graphics_clocks.clone(),
            ClockDomain::Memory => self.memory_clocks.clone(),
        })
    }

    fn power_limit_range(&self) -> DeviceResult<(u32, u32)> {
        Ok(self.power_range)
    }

    fn default_power_limit(&self) -> DeviceResult<u32> {
        Ok(self.default_power_limit)
    }

    fn set_power_limit(&mut self, watts: u32) -> DeviceResult<()> {
        self.power_limit = watts;
        self.commands.push(Command::PowerLimit(watts));
        Ok(())
    }

    fn temperature_threshold_range(&self) -> DeviceResult<(i32, i32)> {
        self.threshold
            .map(|_| self.threshold_range)
            .ok_or(DeviceError::NotSupported)
    }

    fn temperature_threshold(&self) -> DeviceResult<i32> {
        self.threshold.ok_or(DeviceError::NotSupported)
    }

    fn set_temperature_threshold(&mut self, celsius: i32) -> DeviceResult<()> {
        if self.threshold.is_none() || self.read_only_limits {
            return Err(DeviceError::NotSupported);
        }
        self.threshold = Some(celsius);
        self.commands.push(Command::TemperatureThreshold(celsius));
        Ok(())
    }

    fn persistence_mode(&self) -> DeviceResult<bool> {
        self.persistence.ok_or(DeviceError::NotSupported)
    }

    fn set_persistence_mode(&mut self, enabled: bool) -> DeviceResult<()> {
        if self.persistence.is_none() || self.read_only_limits {
            return Err(DeviceError::NotSupported);
        }
        self.persistence = Some(enabled);
        self.commands.push(Command::PersistenceMode(enabled));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_mutating_calls() {
        let mut device = SimulatedDevice::new();
        device.set_fan_speed(1, 55).unwrap();
        device.set_locked_clocks(1500, 1530).unwrap();

        assert_eq!(
            device.take_commands(),
            vec![
                Command::FanSpeed { fan: 1, percent: 55 },
                Command::LockedClocks { min: 1500, max: 1530 },
            ]
        );
        assert!(device.commands().is_empty());
        assert_eq!(device.fan_policy(1), Some(FanPolicy::Manual));
        assert_eq!(device.fan_policy(0), Some(FanPolicy::Automatic));
    }

    #[test]
    fn test_wandering_stays_inside_lock() {
        let mut device = SimulatedDevice::wandering();
        device.set_locked_clocks(1500, 1530).unwrap();
        for _ in 0..200 {
            device.refresh().unwrap();
            let clock = device.clock(ClockDomain::Graphics).unwrap();
            assert!((1500..=1530).contains(&clock), "clock {} escaped lock", clock);
            let temp = device.temperature().unwrap();
            assert!((30..=90).contains(&temp));
        }
    }

    #[test]
    fn test_optional_features_report_not_supported() {
        let mut device = SimulatedDevice::new()
            .with_persistence(None)
            .with_temperature_threshold(None);
        assert_eq!(device.persistence_mode(), Err(DeviceError::NotSupported));
        assert_eq!(
            device.set_temperature_threshold(70),
            Err(DeviceError::NotSupported)
        );
    }
}
