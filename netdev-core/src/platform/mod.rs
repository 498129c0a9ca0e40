//! Vendor abstraction.
//!
//! A [`VendorHandler`] describes one CLI dialect: how to talk to it (the
//! [`Dialect`]) and which command sequences implement each configuration
//! operation. Handlers never perform I/O. They return [`Plan`]s that the
//! executor runs over a pooled session, which keeps the transaction engine
//! identical for every vendor.

mod dialect;
mod privilege_level;
mod registry;
pub mod vendors;

pub use dialect::{Dialect, Transition};
pub use privilege_level::PrivilegeLevel;
pub use registry::HandlerRegistry;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceType;
use crate::error::{ConfigError, Result};
use crate::parse::{JsonParser, OutputParser};

/// Representation of a configuration payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    /// Native text (Cisco lines, Junos curly-brace hierarchy).
    #[default]
    Text,
    /// Junos `set` / `delete` statements.
    Set,
    /// Structured JSON.
    Json,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigFormat::Text => "text",
            ConfigFormat::Set => "set",
            ConfigFormat::Json => "json",
        })
    }
}

/// What part of the running configuration to read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigQuery {
    /// Hierarchy or section filter (`interfaces`, `router bgp`).
    pub section: Option<String>,
    pub format: ConfigFormat,
    /// Show values inherited from configuration groups (Junos).
    pub expand_groups: bool,
}

impl ConfigQuery {
    /// Full running configuration in native text.
    pub fn running() -> Self {
        Self::default()
    }

    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn format(mut self, format: ConfigFormat) -> Self {
        self.format = format;
        self
    }

    pub fn expand_groups(mut self) -> Self {
        self.expand_groups = true;
        self
    }
}

/// One interaction with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send a line and wait for a prompt.
    Command(String),
    /// Send a line and wait for `pattern` instead of a prompt.
    Expect { command: String, pattern: String },
    /// Send a line without waiting (bulk terminal input).
    Write(String),
    /// Send Ctrl-D to end terminal input, then wait for a prompt.
    EndOfInput,
}

impl Step {
    pub fn command(command: impl Into<String>) -> Self {
        Step::Command(command.into())
    }

    /// The text sent for this step, for logs and errors.
    pub fn text(&self) -> &str {
        match self {
            Step::Command(c) | Step::Write(c) => c,
            Step::Expect { command, .. } => command,
            Step::EndOfInput => "^D",
        }
    }
}

/// Ordered steps for one operation.
pub type Plan = Vec<Step>;

/// What a rollback should restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Throw away the uncommitted candidate.
    Candidate,
    /// Revert the last commit (device stays in configuration mode on entry).
    PreviousCommit,
    /// Restore a named checkpoint.
    Checkpoint(String),
}

/// Shared capability interface implemented once per vendor.
///
/// Methods that a vendor cannot honour return
/// [`ConfigError::Unsupported`]; the engine never branches on device type.
pub trait VendorHandler: Send + Sync {
    /// Device type this handler serves.
    fn device_type(&self) -> DeviceType;

    /// Prompt, paging and privilege description.
    fn dialect(&self) -> &Dialect;

    /// Final command text for the wire. `parser` lets vendors ask the device
    /// for machine-readable output (`| json`).
    fn format_command(&self, command: &str, _parser: Option<&str>) -> String {
        command.to_string()
    }

    /// Operational command as typed from configuration mode.
    fn exec_from_config(&self, command: &str) -> String {
        command.to_string()
    }

    /// Strip echo, prompt and vendor noise from raw output.
    fn normalize_output(&self, raw: &str, command: &str) -> String {
        normalize_output(raw, command)
    }

    /// Built-in structured parsers, keyed by name.
    fn parse_output(&self, parser: &str, output: &str) -> Option<Value> {
        match parser {
            "json" => JsonParser.parse(output),
            _ => None,
        }
    }

    /// Failure message if the output reports an error.
    fn detect_failure(&self, output: &str) -> Option<String> {
        self.dialect().detect_failure(output)
    }

    /// Edits accumulate in a candidate and only apply on commit.
    fn supports_staged_commit(&self) -> bool;

    /// Commits can auto-revert unless confirmed.
    fn supports_confirmed_commit(&self) -> bool {
        false
    }

    /// Named checkpoints can be taken and restored.
    fn supports_checkpoint(&self) -> bool {
        false
    }

    /// Payload formats accepted by `load_config` and `show_config`.
    fn config_formats(&self) -> &'static [ConfigFormat] {
        &[ConfigFormat::Text]
    }

    fn enter_config_mode(&self) -> Plan;

    fn exit_config_mode(&self) -> Plan;

    /// Command that prints the configuration selected by `query`.
    fn show_config(&self, query: &ConfigQuery) -> Result<String>;

    /// Reduce `show_config` output to configuration content only, so that a
    /// snapshot can be re-applied and compared byte for byte.
    fn clean_config(&self, output: &str) -> String {
        output.trim_matches('\n').to_string()
    }

    /// Syntax pre-check run before anything is sent.
    fn validate_payload(&self, payload: &str, format: ConfigFormat) -> Result<()>;

    /// Steps that load `payload`, run from configuration mode.
    fn load_config(&self, payload: &str, format: ConfigFormat, replace: bool) -> Result<Plan>;

    /// Steps that commit staged changes. A plain commit also leaves
    /// configuration mode; a confirmed commit stays in it.
    fn commit(&self, _confirm_within: Option<Duration>) -> Result<Plan> {
        Ok(self.exit_config_mode())
    }

    /// Whether a commit step's output reports success.
    fn commit_succeeded(&self, _output: &str) -> bool {
        true
    }

    /// Steps that confirm a pending confirmed commit.
    fn confirm_commit(&self) -> Result<Plan> {
        Err(self.unsupported("confirm commit"))
    }

    /// Steps that drop the uncommitted candidate and leave configuration mode.
    fn discard(&self) -> Result<Plan> {
        Err(self.unsupported("discard"))
    }

    /// Steps that perform a native rollback.
    fn rollback(&self, _target: &RollbackTarget) -> Result<Plan> {
        Err(self.unsupported("native rollback"))
    }

    /// Steps that take a named checkpoint (no-op unless supported).
    fn checkpoint(&self, _name: &str) -> Plan {
        Vec::new()
    }

    /// Command showing uncommitted changes.
    fn diff(&self) -> Result<String> {
        Err(self.unsupported("diff"))
    }

    /// Command validating the candidate without committing.
    fn check(&self) -> Result<String> {
        Err(self.unsupported("commit check"))
    }

    /// Whether `check` output reports a valid candidate.
    fn check_succeeded(&self, output: &str) -> bool {
        self.detect_failure(output).is_none()
    }

    /// Helper for the `Unsupported` error.
    fn unsupported(&self, operation: &str) -> crate::error::Error {
        ConfigError::Unsupported {
            operation: operation.to_string(),
            platform: self.device_type().to_string(),
        }
        .into()
    }
}

impl fmt::Debug for dyn VendorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorHandler")
            .field("device_type", &self.device_type())
            .field("dialect", &self.dialect().name)
            .finish()
    }
}

/// Default output normalization.
///
/// Resolves carriage-return overwrites, drops the command echo (first line)
/// and the trailing prompt (last line).
pub fn normalize_output(raw: &str, command: &str) -> String {
    let mut lines: Vec<&str> = raw
        .lines()
        .map(|line| {
            let line = line.trim_end_matches('\r');
            line.rsplit('\r').next().unwrap_or(line)
        })
        .collect();

    let command = command.trim();
    if !command.is_empty()
        && lines
            .first()
            .is_some_and(|first| first.trim_end().ends_with(command))
    {
        lines.remove(0);
    }

    // Trailing prompt
    lines.pop();

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}
