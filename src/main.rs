//! Main entry point for the GPU curve controller

#[cfg(not(feature = "nvml"))]
use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use gpu_curve::{
    args::Args,
    config::{self, Settings},
    daemon::{self, Daemon},
    device::{sim::SimulatedDevice, Device, TIER_RANGE},
    logging, Config,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Print version and build metadata for binary identity verification
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_desc = option_env!("GIT_DESC").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    eprintln!(
        "gpu-curve v{} (git {} / {}) built {}",
        pkg_version, git_hash, git_desc, build_time
    );

    let args = Args::parse();

    // Env file entries override the process environment
    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(path) = &args.env {
        let vars = config::load_env_file(path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?;
        env.extend(vars);
    }

    let settings = Settings::resolve(&args, &env)?;
    logging::setup(
        logging::effective_verbosity(settings.verbose, settings.test),
        logging::under_journal(&env),
    )?;
    debug!("Resolved settings: {}", serde_json::to_string(&settings)?);

    let config = config::validate(settings, TIER_RANGE)?;
    debug!("Configuration: {}", serde_json::to_string(&config)?);

    if config.simulate {
        warn!("Running against a simulated GPU");
        return run(SimulatedDevice::wandering(), config).await;
    }

    open_and_run(config).await
}

#[cfg(feature = "nvml")]
async fn open_and_run(config: Config) -> anyhow::Result<()> {
    let device = gpu_curve::device::nvml::NvmlDevice::open(&config.device)
        .with_context(|| format!("Failed to open GPU by {}", config.device))?;
    run(device, config).await
}

#[cfg(not(feature = "nvml"))]
async fn open_and_run(_config: Config) -> anyhow::Result<()> {
    bail!("Built without NVML support (default features disabled), pass --simulate")
}

async fn run<D: Device>(device: D, config: Config) -> anyhow::Result<()> {
    let mut daemon = Daemon::new(device, config, Instant::now())?;

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(e) = daemon::signal_handling(stop).await {
                warn!("Signal handling unavailable: {}", e);
            }
        }
    });

    daemon.run(&stop).await?;
    Ok(())
}
