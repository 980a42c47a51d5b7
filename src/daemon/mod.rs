//! Control loop for one GPU
//!
//! The daemon owns the device and both controllers. It applies the startup
//! limits, ticks the controllers until the stop flag is raised, and restores
//! the device defaults on the way out, including after a runtime error.

use crate::{
    config::Config,
    device::{
        require_version, ClockDomain, Device, DeviceResult, CLOCK_OFFSET_VERSION,
        FAN_CONTROL_VERSION,
    },
    errors::{ConfigError, DeviceError, GpuCurveError, Result},
    fan_control::FanController,
    undervolt::{ClockWindow, ClockWindowController},
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

/// Device values changed at startup that must be put back on shutdown
#[derive(Debug, Default)]
struct SavedState {
    persistence_enabled: bool,
    default_power_limit: Option<u32>,
    temperature_threshold: Option<i32>,
}

/// Main daemon structure
pub struct Daemon<D: Device> {
    device: D,
    config: Config,
    fan: Option<FanController>,
    clocks: Option<ClockWindowController>,
    temperature_limit: Option<i32>,
    saved: SavedState,
}

impl<D: Device> Daemon<D> {
    /// Check the device against the configuration and build the controllers.
    ///
    /// Nothing is written to the device here.
    pub fn new(device: D, config: Config, now: Instant) -> Result<Self> {
        info!("Using {} ({})", device.name()?, device.uuid()?);
        debug!("Driver library version {}", device.library_version()?);

        let fan = match &config.fan {
            Some(settings) => {
                require_version(&device, FAN_CONTROL_VERSION)?;
                let fans = device.fan_count()?;
                if fans == 0 {
                    warn!("Device reports no fans, fan curve has nothing to drive");
                } else {
                    info!("Controlling {} fans with curve {}", fans, settings.curve);
                }
                Some(FanController::new(settings, fans, config.dry_run))
            }
            None => None,
        };

        let clocks = match &config.clocks {
            Some(settings) => {
                require_version(&device, CLOCK_OFFSET_VERSION)?;

                let range = device.tier_range();
                if !range.contains(settings.tiers.end()) {
                    return Err(ConfigError::InvalidTiers {
                        ceiling: *settings.tiers.end(),
                        min: *range.start(),
                        max: *range.end(),
                    }
                    .into());
                }

                let supported = device.supported_clocks(ClockDomain::Graphics)?;
                let window = ClockWindow::configure(settings, &supported)?;
                info!(
                    "Clock window {} - {} MHz, offset {} MHz, step {} MHz",
                    window.transition_clock, window.target_clock, window.offset, window.step_mhz
                );
                Some(ClockWindowController::new(
                    settings,
                    window,
                    config.interval,
                    config.dry_run,
                    now,
                ))
            }
            None => None,
        };

        if let Some(watts) = config.power_limit {
            let (min, max) = device.power_limit_range()?;
            if !(min..=max).contains(&watts) {
                return Err(ConfigError::LimitOutOfRange {
                    name: "Power limit",
                    min: min.into(),
                    max: max.into(),
                }
                .into());
            }
        }

        let temperature_limit = match config.temperature_limit {
            Some(celsius) => match device.temperature_threshold_range() {
                Ok((min, max)) if (min..=max).contains(&celsius) => Some(celsius),
                Ok((min, max)) => {
                    return Err(ConfigError::LimitOutOfRange {
                        name: "Temperature limit",
                        min: min.into(),
                        max: max.into(),
                    }
                    .into())
                }
                Err(DeviceError::NotSupported) => {
                    warn!("Temperature limit is not supported by this device, ignoring it");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        if config.dry_run {
            warn!("Running in test mode - no control commands will be executed");
        }

        Ok(Self {
            device,
            config,
            fan,
            clocks,
            temperature_limit,
            saved: SavedState::default(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn fan_controller(&self) -> Option<&FanController> {
        self.fan.as_ref()
    }

    pub fn clock_controller(&self) -> Option<&ClockWindowController> {
        self.clocks.as_ref()
    }

    /// Apply persistence mode and the optional power and temperature limits
    pub fn setup(&mut self) -> Result<()> {
        let dry_run = self.config.dry_run;

        if self.clocks.is_some()
            || self.config.power_limit.is_some()
            || self.temperature_limit.is_some()
        {
            self.setup_persistence()?;
        }

        if let Some(watts) = self.config.power_limit {
            let default = self.device.default_power_limit()?;
            if dry_run {
                info!("Would set power limit to {} W (default {} W)", watts, default);
            } else {
                self.device.set_power_limit(watts)?;
                self.saved.default_power_limit = Some(default);
                info!("Power limit set to {} W (default {} W)", watts, default);
            }
        }

        if let Some(celsius) = self.temperature_limit {
            self.setup_temperature_limit(celsius)?;
        }

        Ok(())
    }

    fn setup_temperature_limit(&mut self, celsius: i32) -> Result<()> {
        let current = match self.device.temperature_threshold() {
            Ok(current) => current,
            Err(DeviceError::NotSupported) => {
                warn!("Temperature limit is not supported by this device, ignoring it");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if self.config.dry_run {
            info!("Would set temperature limit to {}C (currently {}C)", celsius, current);
            return Ok(());
        }

        match self.device.set_temperature_threshold(celsius) {
            Ok(()) => {
                self.saved.temperature_threshold = Some(current);
                info!("Temperature limit set to {}C (was {}C)", celsius, current);
            }
            Err(DeviceError::NotSupported) => {
                warn!("Temperature limit cannot be set on this device, ignoring it");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn setup_persistence(&mut self) -> Result<()> {
        match self.device.persistence_mode() {
            Ok(true) => {
                warn!("Persistence mode is already enabled, another tool may control this GPU");
            }
            Ok(false) if self.config.dry_run => info!("Would enable persistence mode"),
            Ok(false) => match self.device.set_persistence_mode(true) {
                Ok(()) => {
                    self.saved.persistence_enabled = true;
                    info!("Persistence mode enabled");
                }
                Err(DeviceError::NotSupported) => {
                    warn!("Persistence mode cannot be enabled on this device");
                }
                Err(e) => return Err(e.into()),
            },
            Err(DeviceError::NotSupported) => {
                warn!("Persistence mode is not supported, settings may reset on driver unload");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// One control tick: refresh readings, drive the fans, then the clocks
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.device.refresh()?;

        if let Some(fan) = &mut self.fan {
            fan.update(&mut self.device)?;
        }

        if let Some(clocks) = &mut self.clocks {
            clocks.update(&mut self.device, now)?;
        }

        Ok(())
    }

    /// Put back every device setting changed since startup.
    ///
    /// Every step is attempted. Failures are logged and the first one is
    /// returned.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut first: Option<GpuCurveError> = None;
        let mut record = |step: &str, result: DeviceResult<()>| {
            if let Err(e) = result {
                error!("Failed to {}: {}", step, e);
                first.get_or_insert(e.into());
            }
        };

        if let Some(fan) = &mut self.fan {
            record("restore automatic fan policy", fan.restore(&mut self.device));
        }

        if let Some(watts) = self.saved.default_power_limit.take() {
            record("restore power limit", self.device.set_power_limit(watts));
        }

        if let Some(celsius) = self.saved.temperature_threshold.take() {
            record(
                "restore temperature limit",
                self.device.set_temperature_threshold(celsius),
            );
        }

        if let Some(clocks) = &mut self.clocks {
            record("reset clock offsets and lock", clocks.restore(&mut self.device));
        }

        if std::mem::take(&mut self.saved.persistence_enabled) {
            record(
                "disable persistence mode",
                self.device.set_persistence_mode(false),
            );
        }

        match first {
            Some(e) => Err(e),
            None => {
                info!("Device settings restored");
                Ok(())
            }
        }
    }

    /// Run until `stop` is raised or a device call fails, then clean up.
    ///
    /// A loop error takes precedence over a cleanup error.
    pub async fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        let result = self.control_loop(stop).await;
        if let Err(e) = &result {
            error!("Control loop stopped: {}", e);
        }

        let cleanup = self.shutdown();
        result.and(cleanup)
    }

    async fn control_loop(&mut self, stop: &AtomicBool) -> Result<()> {
        self.setup()?;
        info!("Starting control loop, interval {:?}", self.config.interval);

        while !stop.load(Ordering::SeqCst) {
            self.tick(Instant::now())?;
            sleep(self.config.interval).await;
        }

        info!("Stop requested, leaving control loop");
        Ok(())
    }
}

/// Raise `stop` on SIGINT, SIGHUP or SIGTERM
#[cfg(unix)]
pub async fn signal_handling(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;

    let sig = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = hup.recv() => "SIGHUP",
        _ = term.recv() => "SIGTERM"
    };

    info!("caught signal: {}", sig);
    stop.store(true, Ordering::SeqCst);
    Ok(())
}

#[cfg(not(unix))]
pub async fn signal_handling(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("caught signal: ctrl-c");
    stop.store(true, Ordering::SeqCst);
    Ok(())
}
