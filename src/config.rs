use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::health::Thresholds;
use crate::probe::ProbeOptions;

pub const MAX_RETRIES: u8 = 5;

/// Poller settings. Every field has a default, so an empty YAML document is
/// a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub per_device_timeout: Duration,
    /// Timeout of a single SNMP/ICMP request.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub retries: u8,
    pub community: String,
    pub snmp_port: u16,
    #[serde(with = "humantime_serde")]
    pub inter_batch_pause: Duration,
    pub walk_max_rows: usize,
    pub mib_dirs: Vec<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    pub thresholds: Thresholds,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 20,
            per_device_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            retries: 1,
            community: "public".to_string(),
            snmp_port: 161,
            inter_batch_pause: Duration::ZERO,
            walk_max_rows: 10_000,
            mib_dirs: Vec::new(),
            cycle_interval: Duration::from_secs(300),
            thresholds: Thresholds::default(),
        }
    }
}

impl PollerConfig {
    /// Read a YAML file. `${VAR}` and `${VAR:-default}` are expanded from
    /// the environment before parsing.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let expanded = expand_env_vars(text);
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(&expanded).context("failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrency",
            });
        }
        if self.per_device_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "per_device_timeout",
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "probe_timeout",
            });
        }
        if self.walk_max_rows == 0 {
            return Err(ConfigError::Zero {
                field: "walk_max_rows",
            });
        }
        if self.retries > MAX_RETRIES {
            return Err(ConfigError::TooManyRetries {
                got: self.retries,
                max: MAX_RETRIES,
            });
        }
        if self.probe_timeout > self.per_device_timeout {
            return Err(ConfigError::ProbeExceedsDevice {
                probe_ms: self.probe_timeout.as_millis(),
                device_ms: self.per_device_timeout.as_millis(),
            });
        }
        if !self.thresholds.is_ordered() {
            return Err(ConfigError::Thresholds);
        }
        Ok(())
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: self.probe_timeout,
            retries: self.retries,
            max_rows: self.walk_max_rows,
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` from the environment.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });
    regex
        .replace_all(input, |caps: &regex::Captures| {
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PollerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_concurrency, 20);
        assert_eq!(cfg.retries, 1);
    }

    #[test]
    fn yaml_with_humantime_durations() {
        let cfg = PollerConfig::from_yaml(
            r#"
batch_size: 10
per_device_timeout: 45s
probe_timeout: 1500ms
inter_batch_pause: 2s
community: "${OPTIC_POLL_TEST_MISSING:-private}"
thresholds:
  warning_low: -18.0
"#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.max_concurrency, 20);
        assert_eq!(cfg.per_device_timeout, Duration::from_secs(45));
        assert_eq!(cfg.probe_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.inter_batch_pause, Duration::from_secs(2));
        assert_eq!(cfg.community, "private");
        assert_eq!(cfg.thresholds.warning_low, -18.0);
        assert_eq!(cfg.thresholds.critical_low, -25.0);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(PollerConfig::from_yaml("").unwrap(), PollerConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = PollerConfig::default();
        cfg.batch_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero { field: "batch_size" }));

        let mut cfg = PollerConfig::default();
        cfg.retries = 9;
        assert!(matches!(cfg.validate(), Err(ConfigError::TooManyRetries { got: 9, .. })));

        let mut cfg = PollerConfig::default();
        cfg.probe_timeout = Duration::from_secs(60);
        assert!(matches!(cfg.validate(), Err(ConfigError::ProbeExceedsDevice { .. })));

        assert!(PollerConfig::from_yaml("max_concurrency: 0").is_err());
    }
}
