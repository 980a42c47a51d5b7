use crate::device::{Device, DeviceResult, FanPolicy};
use crate::fan::FanCurve;
use crate::guard::ActuationGuard;
use crate::hysteresis::HysteresisFilter;
use log::{debug, info};
use serde::Serialize;

/// How a computed duty of 0% is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ZeroDutyMode {
    /// Hand the fans back to the device's automatic temperature policy
    Auto,
    /// Write an explicit 0% duty
    Literal,
}

/// Fan settings resolved from the configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanSettings {
    pub curve: FanCurve,
    pub hysteresis: i32,
    pub zero_duty: ZeroDutyMode,
}

/// Drives fan duty from the GPU temperature through the configured curve
pub struct FanController {
    curve: FanCurve,
    filter: HysteresisFilter,
    zero_duty: ZeroDutyMode,
    fans: u32,
    dry_run: bool,
    duty: ActuationGuard<u32>,
}

impl FanController {
    /// Create a controller for a device with `fans` fans
    pub fn new(settings: &FanSettings, fans: u32, dry_run: bool) -> Self {
        Self {
            curve: settings.curve.clone(),
            filter: HysteresisFilter::new(settings.hysteresis),
            zero_duty: settings.zero_duty,
            fans,
            dry_run,
            duty: ActuationGuard::new(),
        }
    }

    /// Filter a raw reading and map it through the curve
    pub fn target_duty(&mut self, raw_temp: i32) -> u32 {
        let control_temp = self.filter.apply(raw_temp);
        self.curve.interpolate(control_temp)
    }

    /// Last duty applied (or logged, in dry-run)
    pub fn applied_duty(&self) -> Option<u32> {
        self.duty.last()
    }

    /// Read the temperature and apply a new duty if it changed.
    ///
    /// Returns whether anything was applied.
    pub fn update<D: Device + ?Sized>(&mut self, device: &mut D) -> DeviceResult<bool> {
        let temp = device.temperature()?;
        if self.fans > 0 {
            debug!("Temperature = {}C, fan 0 speed = {}%", temp, device.fan_speed(0)?);
        }

        let target = self.target_duty(temp);
        let (fans, zero_duty, dry_run) = (self.fans, self.zero_duty, self.dry_run);

        self.duty.apply(target, false, |duty| {
            if dry_run {
                info!("Would set fan speed to {}% ({}C)", duty, temp);
                return Ok(());
            }

            set_fan_duty(device, fans, duty, zero_duty)?;
            info!("Temperature = {}C, Fan speed = {}%", temp, duty);
            Ok(())
        })
    }

    /// Return every fan to the automatic policy
    pub fn restore<D: Device + ?Sized>(&mut self, device: &mut D) -> DeviceResult<()> {
        self.duty.invalidate();
        if self.dry_run {
            return Ok(());
        }

        for fan in 0..self.fans.max(1) {
            device.set_fan_policy(fan, FanPolicy::Automatic)?;
        }
        debug!("Fan control returned to automatic policy");
        Ok(())
    }
}

/// Write `duty` to every fan. A zero duty in [`ZeroDutyMode::Auto`] switches
/// the fans to the automatic policy instead.
pub fn set_fan_duty<D: Device + ?Sized>(
    device: &mut D,
    fans: u32,
    duty: u32,
    zero_duty: ZeroDutyMode,
) -> DeviceResult<()> {
    if duty == 0 && zero_duty == ZeroDutyMode::Auto {
        for fan in 0..fans {
            device.set_fan_policy(fan, FanPolicy::Automatic)?;
        }
        return Ok(());
    }

    for fan in 0..fans {
        device.set_fan_speed(fan, duty)?;
    }
    Ok(())
}
