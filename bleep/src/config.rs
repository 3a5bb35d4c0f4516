//! Core configuration.
//!
//! Everything lives under a per-user root (default `~/.bleep`), overridable
//! through `BLEEP_DB_PATH`, `BLEEP_LOG_LEVEL` and `BLE_CTF_MAC`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Per-user configuration root.
    pub root: PathBuf,
    /// Observation database path; `BLEEP_DB_PATH` overrides.
    pub db_path: PathBuf,
    /// Host adapter name.
    pub adapter: String,
    /// Log level applied when the process installs its subscriber.
    pub log_level: String,
    /// BLE-CTF target, from `BLE_CTF_MAC`.
    pub ctf_mac: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let root = match dirs::home_dir() {
            Some(home) => home.join(".bleep"),
            None => {
                let fallback = std::env::temp_dir().join("bleep");
                tracing::warn!(
                    "home directory could not be determined; using {} for state",
                    fallback.display()
                );
                fallback
            }
        };
        let db_path = std::env::var("BLEEP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("observations.db"));
        let log_level = std::env::var("BLEEP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let ctf_mac = std::env::var("BLE_CTF_MAC")
            .ok()
            .map(|mac| mac.trim().to_ascii_lowercase());
        Self {
            root,
            db_path,
            adapter: "hci0".to_string(),
            log_level,
            ctf_mac,
        }
    }
}

impl CoreConfig {
    /// Config rooted at an explicit directory (tests use a tempdir).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_path: root.join("observations.db"),
            root,
            adapter: "hci0".to_string(),
            log_level: "info".to_string(),
            ctf_mac: None,
        }
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn aoi_dir(&self) -> PathBuf {
        self.root.join("aoi")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root
            .join("reports")
            .join(chrono::Utc::now().format("%Y-%m-%d").to_string())
    }

    pub fn bonds_dir(&self) -> PathBuf {
        self.root.join("bonds")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Install the process-wide tracing subscriber. Safe to call more than once;
/// later calls are ignored.
pub fn init_logging(config: &CoreConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("BLEEP_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_derives_paths() {
        let config = CoreConfig::rooted_at("/tmp/bleep-test");
        assert_eq!(config.db_path, PathBuf::from("/tmp/bleep-test/observations.db"));
        assert_eq!(config.signals_dir(), PathBuf::from("/tmp/bleep-test/signals"));
        assert_eq!(config.bonds_dir(), PathBuf::from("/tmp/bleep-test/bonds"));
    }
}
