//! Error types for netdev-core.
//!
//! Errors are layered the same way the stack is: transport, channel, pool,
//! command, configuration and platform. The top-level [`Error`] maps every
//! variant onto the wire taxonomy exposed through the response envelope
//! (see [`Error::code`] and [`Error::kind`]).

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for netdev-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Configuration transaction errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Platform/vendor errors
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Transport layer errors (SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key changed since it was recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host key not present in known_hosts under strict verification
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Handshake did not complete in time
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Credential reference could not be resolved
    #[error("Credential '{reference}' could not be resolved")]
    CredentialUnavailable { reference: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors (pattern matching, PTY operations).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Failed to open PTY channel
    #[error("Failed to open PTY channel")]
    PtyOpenFailed,

    /// Pattern matching timed out
    #[error("Pattern not found within {0:?}")]
    PatternTimeout(Duration),

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    Closed,

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Session pool errors.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Every session slot for the device stayed busy for the whole wait
    #[error("No session for device '{device}' became available within {waited:?}")]
    Exhausted { device: String, waited: Duration },

    /// Reconnection attempts ran out
    #[error("Could not connect to device '{device}' after {attempts} attempt(s): {source}")]
    ConnectFailed {
        device: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The pool was shut down
    #[error("Session pool is closed")]
    Closed,
}

/// Command execution errors.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The device did not return a prompt in time
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
        /// Output captured before the deadline.
        partial_output: String,
    },

    /// The device reported an error for the command
    #[error("Device rejected '{command}': {message}")]
    Rejected {
        command: String,
        message: String,
        output: String,
    },

    /// Failed to reach the expected privilege level
    #[error("Failed to acquire privilege level '{target}'")]
    PrivilegeAcquisitionFailed { target: String },

    /// The prompt did not match any known privilege level
    #[error("Unknown privilege level from prompt: '{prompt}'")]
    UnknownPrivilege { prompt: String },
}

/// Configuration transaction errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Payload failed the handler's syntax pre-check
    #[error("Configuration validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// The vendor cannot perform the requested operation
    #[error("Operation '{operation}' is not supported by {platform}")]
    Unsupported { operation: String, platform: String },

    /// No confirmed commit is waiting for confirmation
    #[error("No pending commit confirmation on device '{device}'")]
    NoPendingConfirmation { device: String },

    /// Nothing to roll back to
    #[error("No restore point available for device '{device}'")]
    NoRestorePoint { device: String },

    /// Another caller holds an open transaction on the device
    #[error("Device '{device}' has an open transaction owned by '{owner}'")]
    TransactionConflict { device: String, owner: String },

    /// Operation is not valid in the current transaction state
    #[error("Cannot {operation} on device '{device}' in state {state}")]
    InvalidTransition {
        device: String,
        operation: String,
        state: String,
    },

    /// The device refused part of a configuration change
    #[error("Device '{device}' rejected configuration line '{line}': {message}")]
    Rejected {
        device: String,
        line: String,
        message: String,
        output: String,
    },

    /// Commit did not report success
    #[error("Commit failed on device '{device}': {message}")]
    CommitFailed { device: String, message: String },

    /// Backup store lookup failed
    #[error("Backup '{id}' not found")]
    BackupNotFound { id: String },

    /// Backup taken from a different vendor than the target device
    #[error("Backup '{id}' was taken from a {found} device, target is {expected}")]
    BackupMismatch {
        id: String,
        found: String,
        expected: String,
    },

    /// A transaction lost its session (cancelled mid-operation)
    #[error("Transaction on device '{device}' was aborted: {reason}")]
    Aborted { device: String, reason: String },
}

/// Platform/vendor and registry errors.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Invalid platform definition
    #[error("Invalid platform definition: {message}")]
    InvalidDefinition { message: String },

    /// No handler registered for a device type tag
    #[error("Unknown device type: '{name}'")]
    UnknownDeviceType { name: String },

    /// Device id not registered
    #[error("Unknown device: '{id}'")]
    UnknownDevice { id: String },

    /// Device id registered twice
    #[error("Device '{id}' is already registered")]
    DuplicateDevice { id: String },

    /// Invalid core or device configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias using netdev-core's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error categories surfaced to callers.
pub const NETWORK_CONNECTION_ERROR: &str = "NETWORK_CONNECTION_ERROR";
pub const NETWORK_COMMAND_ERROR: &str = "NETWORK_COMMAND_ERROR";
pub const NETWORK_CONFIG_ERROR: &str = "NETWORK_CONFIG_ERROR";
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

impl Error {
    /// Documented error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Transport(_) | Error::Channel(ChannelError::Closed) => NETWORK_CONNECTION_ERROR,
            Error::Pool(_) => NETWORK_CONNECTION_ERROR,
            Error::Channel(_) | Error::Command(_) => NETWORK_COMMAND_ERROR,
            Error::Config(_) => NETWORK_CONFIG_ERROR,
            Error::Platform(_) => INVALID_REQUEST,
        }
    }

    /// Internal error kind, finer-grained than [`code`](Self::code).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(TransportError::ConnectTimeout(_)) => "ConnectTimeout",
            Error::Transport(TransportError::AuthenticationFailed { .. }) => "AuthenticationFailed",
            Error::Transport(_) => "ConnectionError",
            Error::Channel(ChannelError::PatternTimeout(_)) => "CommandTimeout",
            Error::Channel(_) => "ChannelError",
            Error::Pool(PoolError::Exhausted { .. }) => "PoolExhausted",
            Error::Pool(PoolError::ConnectFailed { source, .. })
                if matches!(**source, Error::Transport(TransportError::ConnectTimeout(_))) =>
            {
                "ConnectTimeout"
            }
            Error::Pool(PoolError::ConnectFailed { .. }) => "ConnectionError",
            Error::Pool(PoolError::Closed) => "PoolClosed",
            Error::Command(CommandError::Timeout { .. }) => "CommandTimeout",
            Error::Command(_) => "CommandFailed",
            Error::Config(ConfigError::Validation { .. }) => "ConfigValidationError",
            Error::Config(ConfigError::Unsupported { .. }) => "UnsupportedOperation",
            Error::Config(ConfigError::NoPendingConfirmation { .. }) => "NoPendingConfirmation",
            Error::Config(ConfigError::NoRestorePoint { .. }) => "NoRestorePoint",
            Error::Config(ConfigError::TransactionConflict { .. }) => "TransactionConflict",
            Error::Config(ConfigError::InvalidTransition { .. }) => "InvalidTransition",
            Error::Config(_) => "ConfigFailed",
            Error::Platform(PlatformError::UnknownDevice { .. }) => "UnknownDevice",
            Error::Platform(PlatformError::UnknownDeviceType { .. }) => "UnknownDeviceType",
            Error::Platform(_) => "InvalidRequest",
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// Only pool exhaustion and connection failures are retryable; command
    /// and configuration errors are not, since commands may not be idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Pool(PoolError::Exhausted { .. })
                | Error::Pool(PoolError::ConnectFailed { .. })
                | Error::Transport(_)
        )
    }

    /// Whether the session that produced this error can no longer be trusted.
    pub(crate) fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Channel(_)
                | Error::Command(CommandError::Timeout { .. })
                | Error::Config(ConfigError::Aborted { .. })
        )
    }

    /// Raw device output attached to the error, if any.
    pub fn device_output(&self) -> Option<&str> {
        match self {
            Error::Command(CommandError::Rejected { output, .. })
            | Error::Config(ConfigError::Rejected { output, .. }) => Some(output),
            Error::Command(CommandError::Timeout { partial_output, .. }) => Some(partial_output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_taxonomy() {
        let err: Error = PoolError::Exhausted {
            device: "edge-1".into(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert_eq!(err.code(), NETWORK_CONNECTION_ERROR);
        assert_eq!(err.kind(), "PoolExhausted");
        assert!(err.is_retryable());

        let err: Error = CommandError::Timeout {
            command: "show version".into(),
            timeout: Duration::from_secs(5),
            partial_output: String::new(),
        }
        .into();
        assert_eq!(err.code(), NETWORK_COMMAND_ERROR);
        assert_eq!(err.kind(), "CommandTimeout");
        assert!(!err.is_retryable());
        assert!(err.poisons_session());

        let err: Error = ConfigError::Unsupported {
            operation: "stage".into(),
            platform: "cisco_ios".into(),
        }
        .into();
        assert_eq!(err.code(), NETWORK_CONFIG_ERROR);
        assert_eq!(err.kind(), "UnsupportedOperation");
        assert!(!err.poisons_session());
    }

    #[test]
    fn test_device_output_is_attached() {
        let err: Error = CommandError::Rejected {
            command: "show bogus".into(),
            message: "% Invalid input".into(),
            output: "% Invalid input detected at '^' marker.".into(),
        }
        .into();
        assert_eq!(
            err.device_output(),
            Some("% Invalid input detected at '^' marker.")
        );
    }

    #[test]
    fn test_validation_message_joins_errors() {
        let err = ConfigError::Validation {
            errors: vec!["unbalanced '{'".into(), "line 3: bad".into()],
        };
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: unbalanced '{'; line 3: bad"
        );
    }
}
