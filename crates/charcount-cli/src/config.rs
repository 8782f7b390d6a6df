//! CharCount CLI configuration
//!
//! Settings come from a TOML file with a `[ble]` and a `[cli]` table. The
//! file is taken from `--config` when given, otherwise from
//! `<config dir>/charcount/charcount.toml` if it exists; every missing key
//! falls back to its default.
//!
//! ```toml
//! [ble]
//! connection_timeout_secs = 10
//! dedup = "by_name"
//!
//! [cli]
//! json = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use charcount_ble::{BleSessionConfig, DedupPolicy};
use charcount_core::DEFAULT_MAX_PAYLOAD_LEN;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ble: BleSection,
    pub cli: CliSection,
}

/// BLE session settings as written in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSection {
    pub connection_timeout_secs: u64,
    pub max_payload_len: usize,
    pub disconnect_after_browse: bool,
    pub scan_on_power_on: bool,
    pub resume_advertising: bool,
    pub dedup: DedupPolicy,
}

impl Default for BleSection {
    fn default() -> Self {
        let defaults = BleSessionConfig::default();
        Self {
            connection_timeout_secs: defaults.connection_timeout.as_secs(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            disconnect_after_browse: defaults.disconnect_after_browse,
            scan_on_power_on: defaults.scan_on_power_on,
            resume_advertising: defaults.resume_advertising,
            dedup: defaults.dedup,
        }
    }
}

impl BleSection {
    pub fn session_config(&self) -> BleSessionConfig {
        BleSessionConfig::new()
            .with_connection_timeout(Duration::from_secs(self.connection_timeout_secs))
            .with_max_payload_len(self.max_payload_len)
            .with_disconnect_after_browse(self.disconnect_after_browse)
            .with_scan_on_power_on(self.scan_on_power_on)
            .with_resume_advertising(self.resume_advertising)
            .with_dedup(self.dedup)
    }
}

/// CLI-specific settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSection {
    /// Enable verbose logging output
    pub verbose: bool,
    /// Print games and players as JSON lines
    pub json: bool,
}

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Load `--config` if given, else the per-user file if present, else defaults
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("charcount").join("charcount.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.ble.connection_timeout_secs == 0 {
            return Err(CliError::Config(
                "ble.connection_timeout_secs must be positive".to_string(),
            ));
        }
        if self.ble.max_payload_len < 2 {
            return Err(CliError::Config(
                "ble.max_payload_len must leave room for the header".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.ble.session_config(), BleSessionConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [ble]
            connection_timeout_secs = 3
            dedup = "by_name"

            [cli]
            json = true
            "#,
        )
        .unwrap();

        let session = config.ble.session_config();
        assert_eq!(session.connection_timeout, Duration::from_secs(3));
        assert_eq!(session.dedup, DedupPolicy::ByName);
        assert!(session.disconnect_after_browse);
        assert!(config.cli.json);
        assert!(!config.cli.verbose);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        assert!(matches!(
            AppConfig::from_toml("[ble]\nconnection_timeout_secs = 0\n"),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_dedup_policy() {
        assert!(matches!(
            AppConfig::from_toml("[ble]\ndedup = \"by_colour\"\n"),
            Err(CliError::TomlParsing(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(matches!(
            AppConfig::load(Some("/nonexistent/charcount.toml")),
            Err(CliError::Io(_))
        ));
    }
}
