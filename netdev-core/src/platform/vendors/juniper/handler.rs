//! Juniper Junos configuration operations.
//!
//! Junos edits a candidate configuration that only takes effect on commit.
//! The candidate is entered with `configure exclusive`; every plan below
//! assumes the session is already in configuration mode unless noted.

use std::time::Duration;

use serde_json::Value;

use super::platform::{dialect, strip_context_lines};
use crate::device::DeviceType;
use crate::error::{ConfigError, Result};
use crate::parse::{FieldsParser, JsonParser, OutputParser, TableParser};
use crate::platform::{
    ConfigFormat, ConfigQuery, Dialect, Plan, RollbackTarget, Step, VendorHandler, normalize_output,
};

/// Prompt printed by `load ... terminal`.
const LOAD_TERMINAL_PROMPT: &str = r"\[Type \^D at a new line to end input\]";

/// Confirmation asked by a bare `delete` at the top of the hierarchy.
const DELETE_CONFIRM_PROMPT: &str = r"\[yes,no\]";

/// Leading verbs accepted in `set`-format payloads.
const SET_VERBS: &[&str] = &[
    "set", "delete", "deactivate", "activate", "insert", "rename", "annotate", "protect",
    "unprotect",
];

/// Junos accepts confirm windows of 1 to 65535 minutes.
const MAX_CONFIRM_MINUTES: u64 = 65535;

pub struct JuniperHandler {
    dialect: Dialect,
    version: FieldsParser,
    interfaces: TableParser,
}

impl JuniperHandler {
    pub fn new() -> Self {
        let version = FieldsParser::new([
            ("hostname", r"Hostname: (\S+)"),
            ("model", r"Model: (\S+)"),
            ("version", r"Junos: (\S+)"),
        ])
        .unwrap();

        let interfaces = TableParser::new(
            r"^(?P<interface>[\w\-/.:]+)\s+(?P<admin>up|down)\s+(?P<link>up|down)(?:\s+(?P<proto>inet6?|mpls|iso|eth-switch|aenet))?(?:\s+(?P<local>\S+))?\s*$",
        )
        .unwrap();

        Self {
            dialect: dialect(),
            version,
            interfaces,
        }
    }

    /// Brace-format syntax check. `#` comments and `/* */` annotations, as
    /// printed by `show configuration` (`## SECRET-DATA`), are ignored.
    fn validate_text(payload: &str, errors: &mut Vec<String>) {
        let mut depth: i64 = 0;
        let mut in_quote = false;
        let mut in_annotation = false;

        for (idx, line) in payload.lines().enumerate() {
            let n = idx + 1;
            let mut code = String::with_capacity(line.len());
            let mut chars = line.chars().peekable();

            while let Some(c) = chars.next() {
                if in_annotation {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        in_annotation = false;
                    }
                    continue;
                }
                match c {
                    '\\' if in_quote => {
                        code.push(c);
                        if let Some(escaped) = chars.next() {
                            code.push(escaped);
                        }
                    }
                    '"' => {
                        in_quote = !in_quote;
                        code.push(c);
                    }
                    '#' if !in_quote => break,
                    '/' if !in_quote && chars.peek() == Some(&'*') => {
                        chars.next();
                        in_annotation = true;
                    }
                    '{' if !in_quote => {
                        depth += 1;
                        code.push(c);
                    }
                    '}' if !in_quote => {
                        depth -= 1;
                        if depth < 0 {
                            errors.push(format!("line {n}: unexpected '}}'"));
                            depth = 0;
                        }
                        code.push(c);
                    }
                    _ => code.push(c),
                }
            }

            let code = code.trim();
            if in_quote || code.is_empty() {
                continue;
            }
            if !(code.ends_with(';') || code.ends_with('{') || code.ends_with('}')) {
                errors.push(format!("line {n}: statement must end with ';', '{{' or '}}'"));
            }
        }

        if in_quote {
            errors.push("unterminated quoted string".to_string());
        }
        if in_annotation {
            errors.push("unterminated '/*' annotation".to_string());
        }
        if depth > 0 {
            errors.push(format!("{depth} unclosed '{{'"));
        }
    }

    fn validate_set(payload: &str, errors: &mut Vec<String>) {
        for (idx, line) in payload.lines().enumerate() {
            let n = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut words = trimmed.split_whitespace();
            let verb = words.next().unwrap_or_default();
            if !SET_VERBS.contains(&verb) {
                errors.push(format!("line {n}: '{verb}' is not a configuration statement"));
            } else if verb == "set" && words.next().is_none() {
                errors.push(format!("line {n}: 'set' needs a statement"));
            }
        }
    }

    fn load_terminal(command: &str, payload: &str) -> Plan {
        let mut plan = vec![Step::Expect {
            command: command.to_string(),
            pattern: LOAD_TERMINAL_PROMPT.to_string(),
        }];
        plan.extend(payload.lines().map(|l| Step::Write(l.to_string())));
        plan.push(Step::EndOfInput);
        plan
    }
}

impl Default for JuniperHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorHandler for JuniperHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::JuniperJunos
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn format_command(&self, command: &str, parser: Option<&str>) -> String {
        let mut command = command.to_string();
        if parser == Some("json") && !command.contains("display json") {
            command.push_str(" | display json");
        }
        if command.starts_with("show ") && !command.contains("no-more") {
            command.push_str(" | no-more");
        }
        command
    }

    fn exec_from_config(&self, command: &str) -> String {
        format!("run {command}")
    }

    fn normalize_output(&self, raw: &str, command: &str) -> String {
        strip_context_lines(&normalize_output(raw, command))
            .trim_end()
            .to_string()
    }

    fn parse_output(&self, parser: &str, output: &str) -> Option<Value> {
        match parser {
            "json" => JsonParser.parse(output),
            "version" => self.version.parse(output),
            "interfaces_terse" => self.interfaces.parse(output),
            _ => None,
        }
    }

    fn supports_staged_commit(&self) -> bool {
        true
    }

    fn supports_confirmed_commit(&self) -> bool {
        true
    }

    fn config_formats(&self) -> &'static [ConfigFormat] {
        &[ConfigFormat::Text, ConfigFormat::Set, ConfigFormat::Json]
    }

    fn enter_config_mode(&self) -> Plan {
        vec![Step::command("configure exclusive")]
    }

    fn exit_config_mode(&self) -> Plan {
        vec![Step::command("exit configuration-mode")]
    }

    fn show_config(&self, query: &ConfigQuery) -> Result<String> {
        let mut command = String::from("show configuration");
        if let Some(section) = &query.section {
            command.push(' ');
            command.push_str(section);
        }
        if query.expand_groups {
            command.push_str(" | display inheritance");
        }
        match query.format {
            ConfigFormat::Text => {}
            ConfigFormat::Set => command.push_str(" | display set"),
            ConfigFormat::Json => command.push_str(" | display json"),
        }
        command.push_str(" | no-more");
        Ok(command)
    }

    fn clean_config(&self, output: &str) -> String {
        strip_context_lines(output)
            .lines()
            .filter(|l| !l.starts_with("## Last c"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim_matches('\n')
            .to_string()
    }

    fn validate_payload(&self, payload: &str, format: ConfigFormat) -> Result<()> {
        let mut errors = Vec::new();

        if payload.trim().is_empty() {
            errors.push("payload is empty".to_string());
        } else if payload
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            errors.push("payload contains control characters".to_string());
        } else {
            match format {
                ConfigFormat::Text => Self::validate_text(payload, &mut errors),
                ConfigFormat::Set => Self::validate_set(payload, &mut errors),
                ConfigFormat::Json => match serde_json::from_str::<Value>(payload) {
                    Ok(Value::Object(_)) => {}
                    Ok(_) => errors.push("JSON payload must be an object".to_string()),
                    Err(e) => errors.push(format!("invalid JSON: {e}")),
                },
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { errors }.into())
        }
    }

    fn load_config(&self, payload: &str, format: ConfigFormat, replace: bool) -> Result<Plan> {
        self.validate_payload(payload, format)?;

        let plan = match format {
            ConfigFormat::Set => {
                let mut plan = Vec::new();
                if replace {
                    plan.push(Step::Expect {
                        command: "delete".to_string(),
                        pattern: DELETE_CONFIRM_PROMPT.to_string(),
                    });
                    plan.push(Step::command("yes"));
                }
                plan.extend(
                    payload
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(Step::command),
                );
                plan
            }
            ConfigFormat::Text => {
                let command = if replace { "load override terminal" } else { "load merge terminal" };
                Self::load_terminal(command, payload)
            }
            ConfigFormat::Json => {
                let command = if replace {
                    "load override json terminal"
                } else {
                    "load merge json terminal"
                };
                Self::load_terminal(command, payload)
            }
        };
        Ok(plan)
    }

    fn commit(&self, confirm_within: Option<Duration>) -> Result<Plan> {
        match confirm_within {
            None => Ok(vec![Step::command("commit and-quit")]),
            Some(window) => {
                let minutes = window.as_secs().div_ceil(60).max(1);
                if minutes > MAX_CONFIRM_MINUTES {
                    return Err(ConfigError::Validation {
                        errors: vec![format!(
                            "confirm window of {minutes} minutes exceeds {MAX_CONFIRM_MINUTES}"
                        )],
                    }
                    .into());
                }
                Ok(vec![Step::command(format!("commit confirmed {minutes}"))])
            }
        }
    }

    fn commit_succeeded(&self, output: &str) -> bool {
        output.contains("commit complete")
    }

    fn confirm_commit(&self) -> Result<Plan> {
        Ok(vec![Step::command("commit and-quit")])
    }

    fn discard(&self) -> Result<Plan> {
        Ok(vec![
            Step::command("rollback 0"),
            Step::command("exit configuration-mode"),
        ])
    }

    fn rollback(&self, target: &RollbackTarget) -> Result<Plan> {
        match target {
            RollbackTarget::Candidate => Ok(vec![Step::command("rollback 0")]),
            RollbackTarget::PreviousCommit => Ok(vec![
                Step::command("rollback 1"),
                Step::command("commit and-quit"),
            ]),
            RollbackTarget::Checkpoint(_) => Err(self.unsupported("named checkpoints")),
        }
    }

    fn diff(&self) -> Result<String> {
        Ok("show | compare".to_string())
    }

    fn check(&self) -> Result<String> {
        Ok("commit check".to_string())
    }

    fn check_succeeded(&self, output: &str) -> bool {
        output.contains("configuration check succeeds")
    }
}
