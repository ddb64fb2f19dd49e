//! Configuration management
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! overrides (`HARBORWATCH_DB_PATH`, `NVD_API_KEY`). Every section has a
//! working default; running without a config file is the normal case.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

const APP_DIR: &str = "harborwatch";

/// Default scan timeout. Pulling and unpacking large images takes minutes.
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 600;

/// Default feed download timeout. Feed archives run to gigabytes.
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;

const DEFAULT_NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const DEFAULT_OSV_BASE_URL: &str = "https://osv-vulnerabilities.storage.googleapis.com";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Vulnerability store location
    pub database: DatabaseConfig,
    /// Image scanner invocation
    pub scanner: ScannerConfig,
    /// Feed endpoints and cache
    pub feeds: FeedsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join(APP_DIR).join("vuln.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Seconds to wait for the scanner subprocess
    pub timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
        }
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub nvd_base_url: String,
    pub osv_base_url: String,
    /// Optional NVD API key; allows a faster paging cadence
    pub nvd_api_key: Option<String>,
    /// Directory for downloaded feed chunks and extracted archives
    pub cache_dir: PathBuf,
    /// Seconds to wait for one feed request
    pub download_timeout_secs: u64,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            nvd_base_url: DEFAULT_NVD_BASE_URL.to_string(),
            osv_base_url: DEFAULT_OSV_BASE_URL.to_string(),
            nvd_api_key: None,
            cache_dir: base.join(APP_DIR),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

impl FeedsConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file when given, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
                toml::from_str(&content)
                    .map_err(|e| AppError::Config(format!("cannot parse {}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HARBORWATCH_DB_PATH")
            && !path.is_empty()
        {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(key) = std::env::var("NVD_API_KEY")
            && !key.is_empty()
        {
            self.feeds.nvd_api_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scanner.timeout_secs, DEFAULT_SCAN_TIMEOUT_SECS);
        assert_eq!(config.feeds.nvd_base_url, DEFAULT_NVD_BASE_URL);
        assert_eq!(config.feeds.osv_base_url, DEFAULT_OSV_BASE_URL);
        assert!(config.feeds.nvd_api_key.is_none());
        assert!(config.database.path.ends_with("vuln.db"));
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[database]
path = "/tmp/test-vuln.db"

[scanner]
timeout_secs = 120

[feeds]
nvd_api_key = "abc123"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/test-vuln.db"));
        assert_eq!(config.scanner.timeout_secs, 120);
        assert_eq!(config.feeds.nvd_api_key.as_deref(), Some("abc123"));
        // untouched sections keep their defaults
        assert_eq!(config.feeds.nvd_base_url, DEFAULT_NVD_BASE_URL);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: test is serialised, nothing else touches the environment
        unsafe {
            std::env::set_var("HARBORWATCH_DB_PATH", "/tmp/override.db");
            std::env::set_var("NVD_API_KEY", "from-env");
        }
        let config = Config::load(None).unwrap();
        unsafe {
            std::env::remove_var("HARBORWATCH_DB_PATH");
            std::env::remove_var("NVD_API_KEY");
        }
        assert_eq!(config.database.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.feeds.nvd_api_key.as_deref(), Some("from-env"));
    }
}
