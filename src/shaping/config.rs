//! Shaping Engine Configuration
//!
//! Timing and enforcement knobs that are not part of the pod's bandwidth
//! policy: they belong to the node running the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::sketch::DecayMode;
use crate::policy::ValidationError;

/// Default sketch decay interval
pub const DEFAULT_DECAY_INTERVAL_MS: u64 = 1000;

/// Default cool-down, as a multiple of the decay interval
pub const DEFAULT_COOL_DOWN_MULTIPLE: u32 = 3;

/// Default idle time before a flow is forgotten
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Longest accepted decay or sweep interval (one hour)
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Largest accepted cool-down multiple
pub const MAX_COOL_DOWN_MULTIPLE: u32 = 1000;

/// Longest accepted idle timeout (one week)
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// How non-admit decisions are delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Callers can queue: report `Delay`/`Throttle` with a wait time
    #[default]
    Shape,

    /// Callers cannot delay (synchronous packet paths): every non-admit is `Drop`
    Police,
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Sketch decay interval in milliseconds
    pub decay_interval_ms: u64,

    /// Halve or reset counters on decay
    pub decay_mode: DecayMode,

    /// Cool-down length as a multiple of the decay interval
    pub cool_down_multiple: u32,

    /// Seconds without traffic before a flow is evicted
    pub idle_timeout_secs: u64,

    /// Delivery of non-admit decisions
    pub enforcement: EnforcementMode,

    /// Reconciliation tick in milliseconds (defaults to the decay interval)
    pub sweep_interval_ms: Option<u64>,

    /// Fixed sketch seed; random when unset
    pub hash_seed: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            decay_interval_ms: DEFAULT_DECAY_INTERVAL_MS,
            decay_mode: DecayMode::Halve,
            cool_down_multiple: DEFAULT_COOL_DOWN_MULTIPLE,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            enforcement: EnforcementMode::Shape,
            sweep_interval_ms: None,
            hash_seed: None,
        }
    }
}

impl EngineSettings {
    /// Get decay interval
    pub fn decay_interval(&self) -> Duration {
        Duration::from_millis(self.decay_interval_ms)
    }

    /// Get cool-down window
    pub fn cool_down(&self) -> Duration {
        self.decay_interval()
            .checked_mul(self.cool_down_multiple)
            .unwrap_or(Duration::MAX)
    }

    /// Get idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get reconciliation tick
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.decay_interval_ms))
    }

    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns an error naming the first field that is zero or above its
    /// ceiling.
    pub fn validate(&self) -> Result<(), ValidationError> {
        in_range("engine.decay_interval_ms", self.decay_interval_ms, MAX_INTERVAL_MS)?;
        in_range(
            "engine.cool_down_multiple",
            u64::from(self.cool_down_multiple),
            u64::from(MAX_COOL_DOWN_MULTIPLE),
        )?;
        in_range("engine.idle_timeout_secs", self.idle_timeout_secs, MAX_IDLE_TIMEOUT_SECS)?;
        if let Some(sweep) = self.sweep_interval_ms {
            in_range("engine.sweep_interval_ms", sweep, MAX_INTERVAL_MS)?;
        }
        Ok(())
    }

    /// Settings for deterministic tests and replays
    pub fn seeded(seed: u64) -> Self {
        Self {
            hash_seed: Some(seed),
            ..Self::default()
        }
    }
}

fn in_range(field: &'static str, value: u64, max: u64) -> Result<(), ValidationError> {
    if value == 0 || value > max {
        return Err(ValidationError::SettingOutOfRange { field, value, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.decay_interval(), Duration::from_secs(1));
        assert_eq!(settings.cool_down(), Duration::from_secs(3));
        assert_eq!(settings.idle_timeout(), Duration::from_secs(60));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(1));
        assert_eq!(settings.enforcement, EnforcementMode::Shape);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sweep_interval_override() {
        let settings = EngineSettings {
            sweep_interval_ms: Some(250),
            ..EngineSettings::default()
        };
        assert_eq!(settings.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = EngineSettings::default();
        settings.decay_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = EngineSettings::default();
        settings.cool_down_multiple = 0;
        assert!(settings.validate().is_err());

        let mut settings = EngineSettings::default();
        settings.sweep_interval_ms = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_ceilings() {
        let settings = EngineSettings {
            decay_interval_ms: u64::MAX,
            ..EngineSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ValidationError::SettingOutOfRange {
                field: "engine.decay_interval_ms",
                value: u64::MAX,
                max: MAX_INTERVAL_MS,
            })
        );

        let settings = EngineSettings {
            cool_down_multiple: MAX_COOL_DOWN_MULTIPLE + 1,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = EngineSettings {
            decay_interval_ms: MAX_INTERVAL_MS,
            cool_down_multiple: MAX_COOL_DOWN_MULTIPLE,
            idle_timeout_secs: MAX_IDLE_TIMEOUT_SECS,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_cool_down_saturates() {
        let settings = EngineSettings {
            decay_interval_ms: u64::MAX,
            cool_down_multiple: u32::MAX,
            ..EngineSettings::default()
        };
        assert_eq!(settings.cool_down(), Duration::MAX);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = EngineSettings {
            decay_mode: DecayMode::Reset,
            enforcement: EnforcementMode::Police,
            ..EngineSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"reset\""));
        assert!(json.contains("\"police\""));
        let parsed: EngineSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }
}
