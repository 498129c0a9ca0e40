//! Cisco NX-OS.
//!
//! Changes apply directly, like IOS, but NX-OS keeps named checkpoints of
//! the running configuration. The engine takes one before each change and
//! rolls back to it natively.

use serde_json::Value;

use super::cisco;
use crate::device::DeviceType;
use crate::error::Result;
use crate::parse::{FieldsParser, JsonParser, OutputParser, TableParser};
use crate::platform::{
    ConfigFormat, ConfigQuery, Dialect, Plan, RollbackTarget, Step, VendorHandler,
};

const HOSTNAME_CHARS: &str = r"[\w.\-]";

pub struct CiscoNxosHandler {
    dialect: Dialect,
    version: FieldsParser,
    interfaces: TableParser,
}

impl CiscoNxosHandler {
    pub fn new() -> Self {
        let [exec, privilege_exec, configuration] = cisco::privilege_levels(HOSTNAME_CHARS);

        let dialect = Dialect::new("cisco_nxos")
            .with_privilege(exec)
            .with_privilege(privilege_exec)
            .with_privilege(configuration)
            .with_default_privilege("privilege_exec")
            .with_config_privilege("configuration")
            .with_failure_pattern("% Invalid command")
            .with_failure_pattern("% Invalid input")
            .with_failure_pattern("% Invalid number")
            .with_failure_pattern("% Incomplete command")
            .with_failure_pattern("% Ambiguous command")
            .with_failure_pattern("ERROR:")
            .with_on_open_command("terminal length 0")
            .with_on_open_command("terminal width 511")
            .with_paging(cisco::MORE_PATTERN)
            .unwrap();

        let version = FieldsParser::new([
            ("version", r"(?m)^\s*NXOS: version (\S+)"),
            ("hostname", r"Device name: (\S+)"),
            ("uptime", r"Kernel uptime is ([^\r\n]+)"),
            ("model", r"(?mi)^\s*cisco (Nexus\S*(?: \S+)*?) [Cc]hassis"),
        ])
        .unwrap();

        let interfaces = TableParser::new(
            r"^(?P<interface>\S+)\s+(?P<ip_address>\d+\.\d+\.\d+\.\d+)\s+protocol-(?P<protocol>up|down)/link-(?P<link>up|down)/admin-(?P<admin>up|down)\s*$",
        )
        .unwrap();

        Self {
            dialect,
            version,
            interfaces,
        }
    }
}

impl Default for CiscoNxosHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorHandler for CiscoNxosHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::CiscoNxos
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn exec_from_config(&self, command: &str) -> String {
        format!("do {command}")
    }

    fn format_command(&self, command: &str, parser: Option<&str>) -> String {
        if parser == Some("json") && !command.contains("| json") {
            format!("{command} | json")
        } else {
            command.to_string()
        }
    }

    fn parse_output(&self, parser: &str, output: &str) -> Option<Value> {
        match parser {
            "json" => JsonParser.parse(output),
            "version" => self.version.parse(output),
            "interfaces_brief" => self.interfaces.parse(output),
            _ => None,
        }
    }

    fn supports_staged_commit(&self) -> bool {
        false
    }

    fn supports_checkpoint(&self) -> bool {
        true
    }

    fn config_formats(&self) -> &'static [ConfigFormat] {
        &[ConfigFormat::Text, ConfigFormat::Json]
    }

    fn enter_config_mode(&self) -> Plan {
        vec![Step::command("configure terminal")]
    }

    fn exit_config_mode(&self) -> Plan {
        vec![Step::command("end")]
    }

    fn show_config(&self, query: &ConfigQuery) -> Result<String> {
        let mut command = match &query.section {
            Some(section) => format!("show running-config | section {section}"),
            None => "show running-config".to_string(),
        };
        match query.format {
            ConfigFormat::Text => {}
            ConfigFormat::Json => command.push_str(" | json"),
            ConfigFormat::Set => {
                return Err(self.unsupported("set configuration output"));
            }
        }
        Ok(command)
    }

    fn clean_config(&self, output: &str) -> String {
        cisco::strip_running_config(
            output,
            &["!Command:", "!Running configuration", "!Time:"],
        )
    }

    fn validate_payload(&self, payload: &str, format: ConfigFormat) -> Result<()> {
        if format != ConfigFormat::Text {
            return Err(self.unsupported(&format!("{format} payloads")));
        }
        cisco::validate_lines(payload)
    }

    fn load_config(&self, payload: &str, format: ConfigFormat, _replace: bool) -> Result<Plan> {
        self.validate_payload(payload, format)?;
        Ok(cisco::line_plan(payload))
    }

    fn checkpoint(&self, name: &str) -> Plan {
        vec![Step::command(format!("checkpoint {name}"))]
    }

    fn rollback(&self, target: &RollbackTarget) -> Result<Plan> {
        match target {
            RollbackTarget::Checkpoint(name) => Ok(vec![Step::command(format!(
                "rollback running-config checkpoint {name}"
            ))]),
            _ => Err(self.unsupported("rollback without a checkpoint")),
        }
    }
}
