// Configuration File Support
//
// Node-level settings for natra: logging, shaping engine timing and metrics.
// TOML files with `NATRA_*` environment variable overrides. A missing file
// means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LoggingConfig;
use crate::shaping::{DecayMode, EngineSettings, EnforcementMode};

/// Default location of the settings file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/natra/natra.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Shaping engine configuration
    pub engine: EngineSettings,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to register and report metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Settings {
    /// Load settings from `NATRA_CONFIG` or the default path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    ///
    /// Environment overrides are applied after the file, then the result is
    /// validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// resulting settings are invalid. A missing file yields defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let settings = Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            settings
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let settings = settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Settings file path: `NATRA_CONFIG` if set, otherwise [`DEFAULT_CONFIG_PATH`]
    pub fn config_path() -> PathBuf {
        std::env::var("NATRA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over file values; values that
    /// do not parse are ignored:
    /// - NATRA_LOG_LEVEL
    /// - NATRA_LOG_FORMAT
    /// - NATRA_DECAY_INTERVAL_MS
    /// - NATRA_DECAY_MODE
    /// - NATRA_IDLE_TIMEOUT_SECS
    /// - NATRA_ENFORCEMENT
    /// - NATRA_HASH_SEED
    /// - NATRA_METRICS_ENABLED
    pub fn apply_env_overrides(mut self) -> Self {
        self.logging = self.logging.apply_env();

        // Engine overrides
        if let Some(interval) = env_parse::<u64>("NATRA_DECAY_INTERVAL_MS") {
            if interval > 0 {
                self.engine.decay_interval_ms = interval;
            }
        }
        if let Ok(mode) = std::env::var("NATRA_DECAY_MODE") {
            match mode.to_lowercase().as_str() {
                "halve" => self.engine.decay_mode = DecayMode::Halve,
                "reset" => self.engine.decay_mode = DecayMode::Reset,
                _ => {}
            }
        }
        if let Some(idle) = env_parse::<u64>("NATRA_IDLE_TIMEOUT_SECS") {
            if idle > 0 {
                self.engine.idle_timeout_secs = idle;
            }
        }
        if let Ok(mode) = std::env::var("NATRA_ENFORCEMENT") {
            match mode.to_lowercase().as_str() {
                "shape" => self.engine.enforcement = EnforcementMode::Shape,
                "police" => self.engine.enforcement = EnforcementMode::Police,
                _ => {}
            }
        }
        if let Some(seed) = env_parse::<u64>("NATRA_HASH_SEED") {
            self.engine.hash_seed = Some(seed);
        }

        // Metrics overrides
        if let Some(enabled) = env_parse::<bool>("NATRA_METRICS_ENABLED") {
            self.metrics.enabled = enabled;
        }

        self
    }

    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.engine
            .validate()
            .context("Invalid engine settings")?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert_eq!(settings.engine, EngineSettings::default());
        assert!(settings.metrics.enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let settings = Settings::from_toml(
            r#"
[logging]
level = "debug"
format = "json"

[engine]
decay_interval_ms = 500
decay_mode = "reset"
cool_down_multiple = 4
idle_timeout_secs = 120
enforcement = "police"
sweep_interval_ms = 100
hash_seed = 42

[metrics]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.engine.decay_interval_ms, 500);
        assert_eq!(settings.engine.decay_mode, DecayMode::Reset);
        assert_eq!(settings.engine.cool_down_multiple, 4);
        assert_eq!(settings.engine.idle_timeout_secs, 120);
        assert_eq!(settings.engine.enforcement, EnforcementMode::Police);
        assert_eq!(settings.engine.sweep_interval_ms, Some(100));
        assert_eq!(settings.engine.hash_seed, Some(42));
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml("[engine]\ncool_down_multiple = 5\n").unwrap();
        assert_eq!(settings.engine.cool_down_multiple, 5);
        assert_eq!(settings.engine.decay_interval_ms, 1000);
        assert_eq!(settings.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Settings::from_toml("[engine\ndecay_interval_ms = 1").is_err());
        assert!(Settings::from_toml("[engine]\ndecay_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.engine.decay_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.engine.cool_down_multiple = 5000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("missing");
        assert!(Settings::load_from_path(&path).is_ok());
    }

    #[test]
    fn test_load_invalid_file_reports_path() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[engine]\ncool_down_multiple = \"three\"\n").unwrap();

        let err = Settings::load_from_path(temp_file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }
}
