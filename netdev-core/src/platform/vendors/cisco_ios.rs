//! Cisco IOS.
//!
//! Changes apply line by line as they are entered, so there is no candidate,
//! no commit and no native rollback. Rollback is served by the engine from
//! the most recent backup.
//!
//! # Prompt Examples
//!
//! ```text
//! router>                   # exec
//! router#                   # privilege_exec
//! router(config)#           # configuration
//! router(config-if)#        # configuration (sub-mode)
//! ```

use serde_json::Value;

use super::cisco;
use crate::device::DeviceType;
use crate::error::Result;
use crate::parse::{FieldsParser, OutputParser, TableParser};
use crate::platform::{ConfigFormat, ConfigQuery, Dialect, Plan, Step, VendorHandler};

const HOSTNAME_CHARS: &str = r"[\w.\-@/:]";

pub struct CiscoIosHandler {
    dialect: Dialect,
    version: FieldsParser,
    interfaces: TableParser,
}

impl CiscoIosHandler {
    pub fn new() -> Self {
        let [exec, privilege_exec, configuration] = cisco::privilege_levels(HOSTNAME_CHARS);

        let dialect = Dialect::new("cisco_ios")
            .with_privilege(exec)
            .with_privilege(privilege_exec)
            .with_privilege(configuration)
            .with_default_privilege("privilege_exec")
            .with_config_privilege("configuration")
            .with_failure_pattern("% Invalid input")
            .with_failure_pattern("% Incomplete command")
            .with_failure_pattern("% Ambiguous command")
            .with_failure_pattern("% Unknown command")
            .with_on_open_command("terminal length 0")
            .with_on_open_command("terminal width 511")
            .with_paging(cisco::MORE_PATTERN)
            .unwrap();

        let version = FieldsParser::new([
            ("version", r"Cisco IOS Software.*?Version ([^,\s]+)"),
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

impl Default for CiscoIosHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorHandler for CiscoIosHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::CiscoIos
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

    /// `replace` is applied as a merge: IOS has no atomic replace over the
    /// CLI, so lines absent from the payload are left in place.
    fn load_config(&self, payload: &str, format: ConfigFormat, _replace: bool) -> Result<Plan> {
        self.validate_payload(payload, format)?;
        Ok(cisco::line_plan(payload))
    }
}
