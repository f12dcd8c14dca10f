//! TOML server configuration.
//!
//! ```toml
//! [device]
//! serial = "JO123/0045"   # omit to open the first unit found
//! resolution = "12bit"
//! simulate = false
//!
//! [capture]
//! ready_timeout_ms = 60000  # 0 waits forever
//! poll_interval_us = 500
//!
//! [trigger]
//! fallback_range_volts = 2.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::driver::Resolution;
use crate::session::SessionSettings;
use crate::units::VoltageRange;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub serial: Option<String>,
    pub resolution: Resolution,
    pub simulate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSection {
    pub ready_timeout_ms: u64,
    pub poll_interval_us: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 60_000,
            poll_interval_us: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerSection {
    pub fallback_range_volts: f64,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            fallback_range_volts: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub device: DeviceSection,
    pub capture: CaptureSection,
    pub trigger: TriggerSection,
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fallback = self.trigger.fallback_range_volts;
        if !fallback.is_finite() || fallback <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "trigger.fallback_range_volts must be a positive number of volts, got {fallback}"
            )));
        }
        if self.capture.poll_interval_us == 0 {
            return Err(ConfigError::Invalid("capture.poll_interval_us must be non-zero".to_string()));
        }
        if self.device.serial.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid(
                "device.serial must not be empty, omit it to open the first unit".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let fallback_trigger_range = VoltageRange::nearest(self.trigger.fallback_range_volts);
        if (fallback_trigger_range.volts() - self.trigger.fallback_range_volts).abs() > f64::EPSILON {
            log::warn!(
                "trigger.fallback_range_volts {} is not a supported range, using {fallback_trigger_range}",
                self.trigger.fallback_range_volts
            );
        }
        SessionSettings {
            resolution: self.device.resolution,
            fallback_trigger_range,
            ready_timeout: (self.capture.ready_timeout_ms > 0)
                .then(|| Duration::from_millis(self.capture.ready_timeout_ms)),
            poll_interval: Duration::from_micros(self.capture.poll_interval_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        let settings = config.session_settings();
        assert_eq!(settings.resolution, Resolution::Bits12);
        assert_eq!(settings.fallback_trigger_range, VoltageRange::V2);
        assert_eq!(settings.ready_timeout, Some(Duration::from_secs(60)));
        assert_eq!(settings.poll_interval, Duration::from_micros(500));
    }

    #[test]
    fn test_full_file() {
        let config = ServerConfig::from_toml_str(
            r#"
            [device]
            serial = "JO123/0045"
            resolution = "8bit"
            simulate = true

            [capture]
            ready_timeout_ms = 0
            poll_interval_us = 100

            [trigger]
            fallback_range_volts = 4.0
            "#,
        )
        .unwrap();
        assert_eq!(config.device.serial.as_deref(), Some("JO123/0045"));
        assert!(config.device.simulate);
        let settings = config.session_settings();
        assert_eq!(settings.resolution, Resolution::Bits8);
        assert_eq!(settings.ready_timeout, None);
        assert_eq!(settings.fallback_trigger_range, VoltageRange::V5);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            ServerConfig::from_toml_str("[device]\nport = 3\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("[device]\nresolution = \"10bit\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("[trigger]\nfallback_range_volts = -1.0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("[capture]\npoll_interval_us = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("[device]\nserial = \"\"\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load("/nonexistent/picoscope.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
