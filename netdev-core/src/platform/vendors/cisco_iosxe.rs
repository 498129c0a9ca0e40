//! Cisco IOS-XE.
//!
//! Same CLI model as IOS (direct apply, no candidate). Differs in the
//! failure strings it prints and in `show version` layout.

use serde_json::Value;

use super::cisco;
use crate::device::DeviceType;
use crate::error::Result;
use crate::parse::{FieldsParser, OutputParser, TableParser};
use crate::platform::{ConfigFormat, ConfigQuery, Dialect, Plan, Step, VendorHandler};

const HOSTNAME_CHARS: &str = r"[\w.\-@/:]";

pub struct CiscoIosXeHandler {
    dialect: Dialect,
    version: FieldsParser,
    interfaces: TableParser,
}

impl CiscoIosXeHandler {
    pub fn new() -> Self {
        let [exec, privilege_exec, configuration] = cisco::privilege_levels(HOSTNAME_CHARS);

        let dialect = Dialect::new("cisco_iosxe")
            .with_privilege(exec)
            .with_privilege(privilege_exec)
            .with_privilege(configuration)
            .with_default_privilege("privilege_exec")
            .with_config_privilege("configuration")
            .with_failure_pattern("% Invalid input")
            .with_failure_pattern("% Incomplete command")
            .with_failure_pattern("% Ambiguous command")
            .with_failure_pattern("% Unknown command")
            .with_failure_pattern("% Unrecognized command")
            .with_failure_pattern("% Bad mask")
            .with_on_open_command("terminal length 0")
            .with_on_open_command("terminal width 512")
            .with_paging(cisco::MORE_PATTERN)
            .unwrap();

        let version = FieldsParser::new([
            ("version", r"Cisco IOS XE Software, Version (\S+)"),
            ("hostname", r"(?m)^(\S+) uptime is"),
            ("uptime", r"uptime is ([^\r\n]+)"),
            ("image", r#"System image file is "([^"]+)""#),
            ("model", r"(?mi)^cisco (\S+) \(.+\) processor"),
        ])
        .unwrap();

        Self {
            dialect,
            version,
            interfaces: cisco::interfaces_brief(),
        }
    }
}

impl Default for CiscoIosXeHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorHandler for CiscoIosXeHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::CiscoIosxe
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn exec_from_config(&self, command: &str) -> String {
        format!("do {command}")
    }

    fn parse_output(&self, parser: &str, output: &str) -> Option<Value> {
        match parser {
            "version" => self.version.parse(output),
            "interfaces_brief" => self.interfaces.parse(output),
            _ => None,
        }
    }

    fn supports_staged_commit(&self) -> bool {
        false
    }

    fn enter_config_mode(&self) -> Plan {
        vec![Step::command("configure terminal")]
    }

    fn exit_config_mode(&self) -> Plan {
        vec![Step::command("end")]
    }

    fn show_config(&self, query: &ConfigQuery) -> Result<String> {
        if query.format != ConfigFormat::Text {
            return Err(self.unsupported(&format!("{} configuration output", query.format)));
        }
        Ok(match &query.section {
            Some(section) => format!("show running-config | section {section}"),
            None => "show running-config".to_string(),
        })
    }

    fn clean_config(&self, output: &str) -> String {
        cisco::strip_running_config(output, &["Building configuration", "Current configuration"])
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
}
