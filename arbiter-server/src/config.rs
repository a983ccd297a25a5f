//! Runtime configuration.
//!
//! `arbiter.conf` is a small YAML key/value file; database credentials live
//! separately in `.db.config` (a single connection URL line) so that the
//! main config can be world-readable. `DATABASE_URL` overrides the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "arbiter.conf";
pub const DB_CONFIG_FILE: &str = ".db.config";

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads; must be positive.
    pub job_server_workers: usize,
    /// Root for `internal_files/` and `var/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Path to the `proot` binary jailing compiler runs; optional.
    #[serde(default)]
    pub proot_path: Option<PathBuf>,
    /// Compilation wall-time budget in seconds.
    #[serde(default = "default_compile_time_limit_secs")]
    pub compile_time_limit_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_compile_time_limit_secs() -> u64 {
    30
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> anyhow::Result<RuntimeConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: RuntimeConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if config.job_server_workers < 1 {
            bail!("{}: job_server_workers has to be a positive integer", path.display());
        }
        Ok(config)
    }

    pub fn compile_time_limit(&self) -> Duration {
        Duration::from_secs(self.compile_time_limit_secs)
    }

    /// Connection URL from the environment or the credential file next to
    /// the config.
    pub fn database_url(&self) -> anyhow::Result<String> {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return Ok(url);
        }
        let path = self.data_dir.join(DB_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let url = raw.trim();
        if url.is_empty() {
            bail!("{} is empty", path.display());
        }
        Ok(url.to_string())
    }
}

/// UTC wall-clock timestamp in the format stored in `created_at` columns.
pub fn utc_datetime() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "job_server_workers: 4\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.job_server_workers, 4);
        assert_eq!(config.data_dir, PathBuf::from("."));
        assert!(config.proot_path.is_none());
    }

    #[test]
    fn rejects_zero_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "job_server_workers: 0\n").unwrap();
        assert!(RuntimeConfig::load(&path).is_err());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = utc_datetime();
        // The format is fixed-width, so string order is chronological order.
        assert_eq!(a.len(), 19);
        assert!(a > "2020-01-01 00:00:00".to_string());
    }
}
