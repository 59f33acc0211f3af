//! Logging setup

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::LevelFilter;

fn base_dispatch(level: &str) -> Result<fern::Dispatch> {
    let level =
        LevelFilter::from_str(level).map_err(|_| anyhow!("Invalid log level {:?}", level))?;

    Ok(fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level))
}

/// Orchestrator logging: stdout plus an optional file.
pub fn setup_logger(level: &str, log_file: Option<&Path>) -> Result<()> {
    let mut base_config = base_dispatch(level)?.chain(std::io::stdout());

    if let Some(file) = log_file {
        base_config = base_config.chain(fern::log_file(file)?);
    }

    base_config.apply()?;

    Ok(())
}

/// Worker logging. The orchestrator treats every stderr line as an error
/// report, so only `error` records go there.
pub fn setup_worker_logger(level: &str) -> Result<()> {
    base_dispatch(level)?
        .chain(
            fern::Dispatch::new()
                .filter(|meta| meta.level() > log::Level::Error)
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .level(LevelFilter::Error)
                .chain(std::io::stderr()),
        )
        .apply()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_reject_unknown_level() {
        assert!(base_dispatch("loud").is_err());
        assert!(base_dispatch("DEBUG").is_ok());
    }
}
