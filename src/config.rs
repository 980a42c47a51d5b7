//! Configuration resolution and validation
//!
//! Values are merged once at startup with the precedence
//! command line > environment > default, then validated into an immutable
//! [`Config`]. Nothing here touches the device.

use crate::args::Args;
use crate::device::DeviceSelector;
use crate::errors::{ConfigError, GpuCurveError};
use crate::fan::FanCurve;
use crate::fan_control::{FanSettings, ZeroDutyMode};
use crate::undervolt::ClockSettings;
use clap::ValueEnum;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default sleep between ticks, in seconds
pub const DEFAULT_SLEEP: f64 = 1.0;

/// Flat view of every setting after merging, before validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub index: u32,
    pub uuid: String,
    pub curve: Option<String>,
    pub hysteresis: i32,
    pub zero_duty: ZeroDutyMode,
    pub core_offset: i32,
    pub memory_offset: i32,
    pub target_clock: u32,
    pub transition_clock: u32,
    pub linear: bool,
    pub curve_increment: u32,
    pub clock_step: u32,
    pub power_limit: u32,
    pub temperature_limit: i32,
    pub pstates: u32,
    pub sleep: f64,
    pub verbose: u8,
    pub test: bool,
    pub simulate: bool,
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}

fn parse_env<T: FromStr>(
    env: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match env.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            }),
        None => Ok(None),
    }
}

fn pick<T: FromStr>(
    explicit: Option<T>,
    env: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match explicit {
        Some(value) => Ok(value),
        None => Ok(parse_env(env, key)?.unwrap_or(default)),
    }
}

fn flag(explicit: bool, env: &HashMap<String, String>, key: &str) -> bool {
    explicit || env.get(key).map(|v| parse_bool(v)).unwrap_or(false)
}

impl Settings {
    /// Merge command line arguments over environment values over defaults
    pub fn resolve(args: &Args, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let zero_duty = match args.zero_duty {
            Some(mode) => mode,
            None => match env.get("ZERO_DUTY") {
                Some(value) => <ZeroDutyMode as ValueEnum>::from_str(value.trim(), true)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "ZERO_DUTY".to_string(),
                        value: value.clone(),
                    })?,
                None => ZeroDutyMode::Auto,
            },
        };

        let verbose = if args.verbose > 0 {
            args.verbose
        } else {
            match env.get("VERBOSE") {
                Some(value) => value
                    .trim()
                    .parse()
                    .unwrap_or_else(|_| u8::from(parse_bool(value))),
                None => 0,
            }
        };

        Ok(Self {
            index: pick(args.index, env, "INDEX", 0)?,
            uuid: args
                .uuid
                .clone()
                .or_else(|| env.get("UUID").cloned())
                .unwrap_or_default(),
            curve: args.curve.clone().or_else(|| env.get("CURVE").cloned()),
            hysteresis: pick(args.hysteresis, env, "HYSTERESIS", 0)?,
            zero_duty,
            core_offset: pick(args.core_offset, env, "CORE_OFFSET", 0)?,
            memory_offset: pick(args.memory_offset, env, "MEMORY_OFFSET", 0)?,
            target_clock: pick(args.target_clock, env, "TARGET_CLOCK", 0)?,
            transition_clock: pick(args.transition_clock, env, "TRANSITION_CLOCK", 0)?,
            linear: flag(args.linear, env, "LINEAR"),
            curve_increment: pick(args.curve_increment, env, "CURVE_INCREMENT", 0)?,
            clock_step: pick(args.clock_step, env, "CLOCK_STEP", 0)?,
            power_limit: pick(args.power_limit, env, "POWER_LIMIT", 0)?,
            temperature_limit: pick(args.temperature_limit, env, "TEMPERATURE_LIMIT", 0)?,
            pstates: pick(args.pstates, env, "PSTATES", 0)?,
            sleep: pick(args.sleep, env, "SLEEP", DEFAULT_SLEEP)?,
            verbose,
            test: flag(args.test, env, "TEST"),
            simulate: flag(args.simulate, env, "SIMULATE"),
        })
    }

    fn wants_clock_control(&self) -> bool {
        self.core_offset != 0
            || self.memory_offset != 0
            || self.target_clock > 0
            || self.transition_clock > 0
    }
}

/// Validated, immutable configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub device: DeviceSelector,
    pub fan: Option<FanSettings>,
    pub clocks: Option<ClockSettings>,
    pub power_limit: Option<u32>,
    pub temperature_limit: Option<i32>,
    pub interval: Duration,
    pub verbose: u8,
    pub dry_run: bool,
    pub simulate: bool,
}

/// Check merged settings and build the [`Config`].
///
/// `tiers` is the range of performance tiers the device layer accepts.
pub fn validate(settings: Settings, tiers: RangeInclusive<u32>) -> Result<Config, ConfigError> {
    if !tiers.contains(&settings.pstates) {
        return Err(ConfigError::InvalidTiers {
            ceiling: settings.pstates,
            min: *tiers.start(),
            max: *tiers.end(),
        });
    }

    let fan = match &settings.curve {
        Some(curve) => Some(FanSettings {
            curve: curve.parse::<FanCurve>()?,
            hysteresis: settings.hysteresis,
            zero_duty: settings.zero_duty,
        }),
        None => None,
    };

    let clocks = if settings.wants_clock_control() {
        if settings.target_clock == 0 {
            return Err(ConfigError::MissingTargetClock);
        }
        if settings.transition_clock == 0 {
            return Err(ConfigError::MissingTransitionClock);
        }
        if settings.transition_clock.saturating_add(50) >= settings.target_clock {
            return Err(ConfigError::ClockWindowTooNarrow);
        }
        if settings.core_offset <= 0 {
            return Err(ConfigError::MissingCoreOffset);
        }

        Some(ClockSettings {
            core_offset: settings.core_offset,
            memory_offset: settings.memory_offset,
            target_clock: settings.target_clock,
            transition_clock: settings.transition_clock,
            linear: settings.linear,
            curve_increment: settings.curve_increment,
            clock_step: settings.clock_step,
            tiers: *tiers.start()..=settings.pstates,
        })
    } else {
        None
    };

    if fan.is_none() && clocks.is_none() {
        return Err(ConfigError::NothingToControl);
    }

    let interval = if settings.sleep > 0.0 {
        Duration::try_from_secs_f64(settings.sleep)
            .map_err(|_| ConfigError::NonPositiveInterval)?
    } else {
        return Err(ConfigError::NonPositiveInterval);
    };

    let device = if settings.uuid.trim().is_empty() {
        DeviceSelector::Index(settings.index)
    } else {
        DeviceSelector::Uuid(settings.uuid.trim().to_string())
    };

    Ok(Config {
        device,
        fan,
        clocks,
        power_limit: Some(settings.power_limit).filter(|&w| w > 0),
        temperature_limit: Some(settings.temperature_limit).filter(|&c| c > 0),
        interval,
        verbose: settings.verbose,
        dry_run: settings.test,
        simulate: settings.simulate,
    })
}

/// Parse `KEY=value` lines. Blank lines and `#` comments are skipped and a
/// value wrapped in matching single or double quotes is unwrapped.
pub fn parse_env_file(contents: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut vars = HashMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidEnvLine(line.to_string()))?;

        let value = value.trim();
        let unquoted = ['"', '\'']
            .iter()
            .find_map(|&q| {
                value
                    .strip_prefix(q)
                    .and_then(|v| v.strip_suffix(q))
            })
            .unwrap_or(value);

        vars.insert(key.trim().to_string(), unquoted.to_string());
    }

    Ok(vars)
}

/// Read an env file from disk
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, GpuCurveError> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_env_file(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TIER_RANGE;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn clock_args() -> Args {
        Args {
            target_clock: Some(1800),
            transition_clock: Some(1500),
            core_offset: Some(150),
            ..Args::default()
        }
    }

    #[test]
    fn test_explicit_beats_env_beats_default() {
        let args = Args {
            sleep: Some(0.5),
            curve: Some("40:30".to_string()),
            ..Args::default()
        };
        let env = env(&[("SLEEP", "2"), ("HYSTERESIS", "4"), ("CURVE", "50:50")]);
        let settings = Settings::resolve(&args, &env).unwrap();

        assert_eq!(settings.sleep, 0.5);
        assert_eq!(settings.curve.as_deref(), Some("40:30"));
        assert_eq!(settings.hysteresis, 4);
        assert_eq!(settings.index, 0);
        assert_eq!(settings.zero_duty, ZeroDutyMode::Auto);
    }

    #[test]
    fn test_env_booleans_and_modes() {
        let env = env(&[
            ("TEST", "Yes"),
            ("LINEAR", "0"),
            ("VERBOSE", "true"),
            ("ZERO_DUTY", "literal"),
        ]);
        let settings = Settings::resolve(&Args::default(), &env).unwrap();
        assert!(settings.test);
        assert!(!settings.linear);
        assert_eq!(settings.verbose, 1);
        assert_eq!(settings.zero_duty, ZeroDutyMode::Literal);
    }

    #[test]
    fn test_invalid_env_number_is_reported() {
        let env = env(&[("TARGET_CLOCK", "fast")]);
        assert_eq!(
            Settings::resolve(&Args::default(), &env),
            Err(ConfigError::InvalidValue {
                key: "TARGET_CLOCK".to_string(),
                value: "fast".to_string()
            })
        );
    }

    #[test]
    fn test_validate_builds_both_controllers() {
        let args = Args {
            curve: Some("60:40,40:30".to_string()),
            uuid: Some("GPU-1234".to_string()),
            pstates: Some(2),
            power_limit: Some(180),
            ..clock_args()
        };
        let settings = Settings::resolve(&args, &HashMap::new()).unwrap();
        let config = validate(settings, TIER_RANGE).unwrap();

        assert_eq!(config.device, DeviceSelector::Uuid("GPU-1234".to_string()));
        assert_eq!(config.fan.unwrap().curve.to_string(), "40:30,60:40");
        let clocks = config.clocks.unwrap();
        assert_eq!(clocks.tiers, 0..=2);
        assert_eq!(config.power_limit, Some(180));
        assert_eq!(config.temperature_limit, None);
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_clock_settings() {
        let check = |args: Args| {
            validate(Settings::resolve(&args, &HashMap::new()).unwrap(), TIER_RANGE)
        };

        assert_eq!(
            check(Args { target_clock: None, ..clock_args() }),
            Err(ConfigError::MissingTargetClock)
        );
        assert_eq!(
            check(Args { transition_clock: Some(1760), ..clock_args() }),
            Err(ConfigError::ClockWindowTooNarrow)
        );
        assert_eq!(
            check(Args { core_offset: Some(-20), ..clock_args() }),
            Err(ConfigError::MissingCoreOffset)
        );
        assert_eq!(
            check(Args { pstates: Some(15), ..clock_args() }),
            Err(ConfigError::InvalidTiers { ceiling: 15, min: 0, max: 14 })
        );
        assert_eq!(
            check(Args { sleep: Some(0.0), ..clock_args() }),
            Err(ConfigError::NonPositiveInterval)
        );
        assert_eq!(
            check(Args { transition_clock: Some(u32::MAX - 10), ..clock_args() }),
            Err(ConfigError::ClockWindowTooNarrow)
        );
        assert_eq!(check(Args::default()), Err(ConfigError::NothingToControl));
        assert_eq!(
            check(Args { curve: Some(String::new()), ..Args::default() }),
            Err(ConfigError::EmptyCurve)
        );
    }

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# fan settings\n\nCURVE=\"40:30,60:60\"\nHYSTERESIS = 4\nUUID='GPU-ab=cd'\n",
        )
        .unwrap();
        assert_eq!(vars["CURVE"], "40:30,60:60");
        assert_eq!(vars["HYSTERESIS"], "4");
        assert_eq!(vars["UUID"], "GPU-ab=cd");

        assert_eq!(
            parse_env_file("CURVE"),
            Err(ConfigError::InvalidEnvLine("CURVE".to_string()))
        );
    }
}
