//! Device identity and connection options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::settings::duration_str;

/// Vendor variant of a managed device.
///
/// The tag selects the vendor handler once, at resolution time; nothing
/// outside `platform::vendors` branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    CiscoIos,
    CiscoIosxe,
    CiscoNxos,
    JuniperJunos,
}

impl DeviceType {
    /// All built-in device types.
    pub const ALL: [DeviceType; 4] = [
        DeviceType::CiscoIos,
        DeviceType::CiscoIosxe,
        DeviceType::CiscoNxos,
        DeviceType::JuniperJunos,
    ];

    /// The tag used on the wire (`cisco_ios`, `juniper_junos`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::CiscoIos => "cisco_ios",
            DeviceType::CiscoIosxe => "cisco_iosxe",
            DeviceType::CiscoNxos => "cisco_nxos",
            DeviceType::JuniperJunos => "juniper_junos",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = PlatformError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PlatformError::UnknownDeviceType { name: s.to_string() })
    }
}

/// Opaque handle into the credential store. Never a secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(pub String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-device connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Handshake plus authentication budget.
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    /// Default timeout for a single command.
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,

    /// SSH keepalive interval.
    #[serde(with = "duration_str")]
    pub keepalive: Duration,

    /// Maximum live sessions pooled for this device.
    pub max_sessions: usize,

    /// Idle sessions older than this are closed instead of reused.
    #[serde(with = "duration_str")]
    pub idle_ttl: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            max_sessions: 1,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// A managed network device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity, immutable once registered.
    pub id: String,

    /// Hostname or IP address.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Vendor variant.
    pub device_type: DeviceType,

    /// Credential handle resolved at session-open time.
    pub credential: CredentialRef,

    /// Connection tuning.
    #[serde(default)]
    pub options: ConnectionOptions,
}

fn default_port() -> u16 {
    22
}

impl Device {
    /// Create a device with default port and options.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        device_type: DeviceType,
        credential: CredentialRef,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_port(),
            device_type,
            credential,
            options: ConnectionOptions::default(),
        }
    }

    /// Set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the connection options.
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// `host:port` for log lines and transport errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject definitions the pool could never serve.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PlatformError::InvalidConfig {
                message: "device id must not be empty".to_string(),
            }
            .into());
        }
        if self.host.trim().is_empty() {
            return Err(PlatformError::InvalidConfig {
                message: format!("device '{}' has no host", self.id),
            }
            .into());
        }
        if self.options.max_sessions == 0 {
            return Err(PlatformError::InvalidConfig {
                message: format!("device '{}' must allow at least one session", self.id),
            }
            .into());
        }
        Ok(())
    }
}
