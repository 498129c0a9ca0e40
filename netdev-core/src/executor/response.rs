//! Request and result types for command execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::{duration_opt, duration_str};

/// One command to run on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,

    /// Parser key (`json`, `version`, or a registered custom parser).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,

    /// Overrides the device's command timeout.
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parser: None,
            timeout: None,
        }
    }

    pub fn with_parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = Some(parser.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// The command as requested.
    pub command: String,

    /// Output with command echo, prompt and vendor noise removed.
    pub output: String,

    /// Output as read from the device.
    pub raw: String,

    /// The prompt matched at the end.
    pub prompt: String,

    /// Parsed output when a parser was requested and recognised it.
    pub structured: Option<Value>,

    pub success: bool,

    /// Failure message when the device reported an error.
    pub failure_message: Option<String>,

    #[serde(with = "duration_str")]
    pub elapsed: Duration,
}

impl CommandResult {
    /// Check if the result contains a substring.
    pub fn contains(&self, pattern: &str) -> bool {
        self.output.contains(pattern)
    }

    /// Get the output lines as an iterator.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.output)
    }
}

/// How a batch reacts to a device-reported error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Stop after the first failing command.
    #[default]
    FailFast,
    /// Run every command; each result carries its own success flag.
    BestEffort,
}

/// Output of one plan step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Text sent for the step.
    pub sent: String,
    /// Normalized output (empty for writes).
    pub output: String,
    pub raw: String,
}
