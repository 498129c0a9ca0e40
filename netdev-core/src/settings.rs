//! Core configuration.
//!
//! Every section has working defaults; a deployment usually overrides a few
//! values from a TOML file:
//!
//! ```toml
//! [pool]
//! acquire_timeout = "20s"
//!
//! [pool.reconnect]
//! max_attempts = 5
//!
//! [engine]
//! conflict_policy = "reject"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::transport::HostKeyVerification;

/// Top-level configuration for [`NetworkCore`](crate::NetworkCore).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    pub ssh: SshSettings,
    pub executor: ExecutorConfig,
    pub engine: EngineConfig,
}

impl CoreConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| {
            PlatformError::InvalidConfig {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| PlatformError::InvalidConfig {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Session pool behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Default wait for a device lease before `PoolExhausted`.
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,

    /// Reconnect policy for session opening.
    pub reconnect: BackoffConfig,

    /// Send an empty line and wait for the prompt before handing out an idle session.
    pub probe_on_acquire: bool,

    /// Timeout for a single liveness probe.
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            reconnect: BackoffConfig::default(),
            probe_on_acquire: false,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_str")]
    pub base: Duration,
    pub factor: f64,
    #[serde(with = "duration_str")]
    pub cap: Duration,
    /// Fractional jitter, 0.2 means ±20%.
    pub jitter: f64,
    /// Total connect attempts, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

/// SSH transport settings shared by every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub host_key_verification: HostKeyVerification,
    pub known_hosts_path: Option<std::path::PathBuf>,
    pub terminal_width: u32,
    pub terminal_height: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            terminal_width: 511,
            terminal_height: 24,
        }
    }
}

/// Command executor behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bytes from the end of the buffer searched for prompts.
    pub search_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { search_depth: 1000 }
    }
}

/// What to do when a second caller touches a device with an open transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Block on the device lease until the transaction ends or the acquire times out.
    #[default]
    Wait,
    /// Fail immediately with `TransactionConflict`.
    Reject,
}

/// Transaction engine behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub conflict_policy: ConflictPolicy,

    /// Interval of the background confirm-deadline sweep.
    #[serde(with = "duration_str")]
    pub confirm_sweep_interval: Duration,

    /// Prefix for NX-OS checkpoint names.
    pub checkpoint_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::Wait,
            confirm_sweep_interval: Duration::from_secs(1),
            checkpoint_prefix: "netdev".to_string(),
        }
    }
}

/// Serde adapter for durations written as `"30s"`, `"2m"`, `"1h 30m"`.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

/// Same as [`duration_str`] for optional fields; use with `#[serde(default)]`.
pub(crate) mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(de::Error::custom))
            .transpose()
    }
}
