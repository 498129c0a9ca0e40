//! SSH connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::credentials::{Credentials, Secret};
use crate::device::Device;
use crate::settings::SshSettings;

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. For testing and lab use only.
    Disabled,
}

/// SSH connection configuration for one session.
///
/// Built from a [`Device`] plus freshly resolved [`Credentials`]; never stored.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// SSH port.
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Authentication method.
    pub auth: AuthMethod,

    /// Handshake timeout.
    pub timeout: Duration,

    /// Keepalive interval.
    pub keepalive: Duration,

    /// Terminal width for PTY.
    pub terminal_width: u32,

    /// Terminal height for PTY.
    pub terminal_height: u32,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,
}

impl SshConfig {
    /// Assemble the transport config for a device.
    pub fn for_device(device: &Device, credentials: &Credentials, settings: &SshSettings) -> Self {
        let auth = match &credentials.secret {
            Secret::Password(p) | Secret::Token(p) => AuthMethod::Password(p.clone()),
            Secret::PrivateKey { path, passphrase } => AuthMethod::PrivateKey {
                path: path.clone(),
                passphrase: passphrase.clone(),
            },
        };

        Self {
            host: device.host.clone(),
            port: device.port,
            username: credentials.username.clone(),
            auth,
            timeout: device.options.connect_timeout,
            keepalive: device.options.keepalive,
            terminal_width: settings.terminal_width,
            terminal_height: settings.terminal_height,
            host_key_verification: settings.host_key_verification.clone(),
            known_hosts_path: settings.known_hosts_path.clone(),
        }
    }

    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authentication method for SSH connections.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(SecretString),

    /// Private key authentication.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
        /// Optional passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },
}
