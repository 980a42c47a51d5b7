//! Logging setup for the GPU curve controller

use fern::Dispatch;
use log::LevelFilter;
use std::collections::HashMap;

/// Whether the process was started by systemd with output going to the journal
pub fn under_journal(env: &HashMap<String, String>) -> bool {
    env.contains_key("INVOCATION_ID") || env.contains_key("JOURNAL_STREAM")
}

/// Map a `-v` count to a level filter
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Dry-run decisions are logged at info, so a dry run never logs below it
pub fn effective_verbosity(verbose: u8, dry_run: bool) -> u8 {
    if dry_run {
        verbose.max(1)
    } else {
        verbose
    }
}

/// Setup logging with the specified verbosity level.
///
/// The journal stamps every line itself, so `journal` drops the timestamp.
pub fn setup(verbosity: u8, journal: bool) -> Result<(), fern::InitError> {
    let dispatch = if journal {
        Dispatch::new().format(|out, message, record| {
            out.finish(format_args!("[{}] {}: {}", record.level(), record.target(), message))
        })
    } else {
        Dispatch::new().format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
    };

    dispatch
        .level(level_for(verbosity))
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}
