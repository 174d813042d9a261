use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "core.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub lease_timeout_ms: u64,
    pub save_debounce_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_stale_after_ms: u64,
    pub journal_max_entries_per_item: usize,
    /// Overrides `<data_dir>/session.sqlite` for the lease and heartbeat slots.
    pub session_store_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 5_000,
            save_debounce_ms: 800,
            heartbeat_interval_ms: 2_000,
            heartbeat_stale_after_ms: 15_000,
            journal_max_entries_per_item: 16,
            session_store_path: None,
        }
    }
}

impl CoreConfig {
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let path = Self::config_path(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|error| {
            AppError::Validation(format!("failed to parse {}: {}", path.display(), error))
        })
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::CoreConfig;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CoreConfig::load(dir.path()).expect("load config");
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            CoreConfig::config_path(dir.path()),
            r#"{ "leaseTimeoutMs": 1200, "saveDebounceMs": 50 }"#,
        )
        .expect("write config");

        let config = CoreConfig::load(dir.path()).expect("load config");
        assert_eq!(config.lease_timeout_ms, 1_200);
        assert_eq!(config.save_debounce_ms, 50);
        assert_eq!(config.journal_max_entries_per_item, 16);
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(CoreConfig::config_path(dir.path()), "{ nope").expect("write config");
        let error = CoreConfig::load(dir.path()).expect_err("malformed config");
        assert!(error.to_string().starts_with("VALIDATION"));
    }
}
