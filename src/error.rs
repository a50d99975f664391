use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-device / per-field failure categories carried in a `PollOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Unreachable,
    MalformedResponse,
    UnsupportedCapability,
    NormalizeError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::UnsupportedCapability => "unsupported_capability",
            ErrorKind::NormalizeError => "normalize_error",
        };
        f.write_str(s)
    }
}

/// Configuration rejected by `PollerConfig::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("retries must be at most {max}, got {got}")]
    TooManyRetries { got: u8, max: u8 },

    #[error("probe_timeout ({probe_ms} ms) exceeds per_device_timeout ({device_ms} ms)")]
    ProbeExceedsDevice { probe_ms: u128, device_ms: u128 },

    #[error("optical thresholds must satisfy critical_low <= warning_low <= warning_high <= critical_high")]
    Thresholds,
}

/// Fatal, cycle-level failure. Per-device failures never produce this.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("invalid poller configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("a poll cycle is already running")]
    AlreadyRunning,
}
