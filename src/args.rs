//! Command line argument parsing for the GPU curve controller
//!
//! Every setting is optional here. Unset values fall back to the environment
//! and then to defaults in [`crate::config::Settings::resolve`].

use crate::fan_control::ZeroDutyMode;
use clap::Parser;
use std::path::PathBuf;

/// GPU Curve Controller
///
/// Drives NVIDIA GPU fan speed from a temperature curve and undervolts by
/// locking the core clock into a window with a per-pstate clock offset.
#[derive(Parser, Debug, Default)]
#[command(name = "gpu-curve")]
#[command(about = "Fan curve and undervolt control using the official NVML API")]
#[command(version)]
pub struct Args {
    /// Env file to load
    #[arg(short, long)]
    pub env: Option<PathBuf>,

    /// Device index
    #[arg(short, long)]
    pub index: Option<u32>,

    /// Device UUID
    #[arg(short, long)]
    pub uuid: Option<String>,

    /// Fan curve points, in format "temperature:speed,..."
    #[arg(short, long)]
    pub curve: Option<String>,

    /// Temperature hysteresis (down only)
    #[arg(short = 'y', long, allow_hyphen_values = true)]
    pub hysteresis: Option<i32>,

    /// How a computed fan speed of 0% is applied
    #[arg(short, long, value_enum)]
    pub zero_duty: Option<ZeroDutyMode>,

    /// Core clock offset
    #[arg(short = 'o', long)]
    pub core_offset: Option<i32>,

    /// Memory clock offset
    #[arg(short, long)]
    pub memory_offset: Option<i32>,

    /// Target clock
    #[arg(short = 'a', long)]
    pub target_clock: Option<u32>,

    /// Clock at which to toggle the changes
    #[arg(short = 'r', long)]
    pub transition_clock: Option<u32>,

    /// Use linear curve mode
    #[arg(short, long)]
    pub linear: bool,

    /// Linear curve increments
    #[arg(short = 'n', long)]
    pub curve_increment: Option<u32>,

    /// Core clock step in MHz
    #[arg(short = 'k', long)]
    pub clock_step: Option<u32>,

    /// Power limit in watts (W)
    #[arg(short = 'w', long)]
    pub power_limit: Option<u32>,

    /// Temperature limit in celsius (C)
    #[arg(short = 'd', long)]
    pub temperature_limit: Option<i32>,

    /// Highest pstate to apply offsets to
    #[arg(short, long)]
    pub pstates: Option<u32>,

    /// Sleep time in main loop, in seconds
    #[arg(short, long)]
    pub sleep: Option<f64>,

    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Do not execute control commands
    #[arg(short, long)]
    pub test: bool,

    /// Run against a simulated GPU instead of NVML
    #[arg(long)]
    pub simulate: bool,
}
