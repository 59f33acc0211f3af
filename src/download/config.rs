//!
//! # Configuration module
//!

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::scaler::MIN_CONCURRENCY;

const APP_DIR: &str = "folder-downloader";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind_addr: String,
    /// Upper bound for the number of random workers.
    pub max_concurrency: usize,
    /// Random workers a fresh session starts with.
    pub default_concurrency: usize,
    /// Where workers publish their progress records.
    pub progress_dir: PathBuf,
    pub sample_interval_ms: u64,
    pub throughput_window: usize,
    /// Worker executable; the running binary when unset.
    pub worker_program: Option<PathBuf>,
    /// Arguments placed before the `worker` subcommand.
    pub worker_args: Vec<String>,
    /// Paused-session state; persistence is off when unset.
    pub state_file: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn load_from_file(file_path: &Path) -> Result<Self> {
        let config_data = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file {:?}", file_path))?;
        let config: Config = serde_json::from_str(&config_data)
            .with_context(|| format!("Failed to parse config file {:?}", file_path))?;

        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load_from_file`], but a missing file means defaults.
    pub fn load_or_default(file_path: &Path) -> Result<Self> {
        if file_path.exists() {
            Self::load_from_file(file_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency < MIN_CONCURRENCY {
            bail!(
                "max_concurrency must be at least {}, got {}",
                MIN_CONCURRENCY,
                self.max_concurrency
            );
        }
        if !(MIN_CONCURRENCY..=self.max_concurrency).contains(&self.default_concurrency) {
            bail!(
                "default_concurrency {} outside {}..={}",
                self.default_concurrency,
                MIN_CONCURRENCY,
                self.max_concurrency
            );
        }
        if self.sample_interval_ms == 0 {
            bail!("sample_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().context("Failed to locate the running executable"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let progress_dir = dirs::cache_dir()
            .map(|dir| dir.join(APP_DIR).join("progress"))
            .unwrap_or_else(|| PathBuf::from("progress"));
        let state_file = dirs::config_dir().map(|dir| dir.join(APP_DIR).join("session.json"));

        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_concurrency: 100,
            default_concurrency: MIN_CONCURRENCY,
            progress_dir,
            sample_interval_ms: 1000,
            throughput_window: 60,
            worker_program: None,
            worker_args: Vec::new(),
            state_file,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn should_fill_missing_fields_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{ "max_concurrency": 16, "progress_dir": "/tmp/p" }"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.progress_dir, PathBuf::from("/tmp/p"));
        assert_eq!(config.default_concurrency, 2);
        assert_eq!(config.throughput_window, 60);
        assert_eq!(config.sample_interval(), Duration::from_secs(1));
    }

    #[test]
    fn should_reject_inconsistent_bounds() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{ "max_concurrency": 4, "default_concurrency": 8 }"#).unwrap();
        assert!(Config::load_from_file(&path).is_err());

        fs::write(&path, r#"{ "max_concurrency": 1 }"#).unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn should_default_when_file_missing() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }
}
