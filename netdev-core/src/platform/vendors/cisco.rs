//! Pieces shared by the line-oriented Cisco CLIs (IOS, IOS-XE, NX-OS).
//!
//! These are plain functions over the payload; each handler keeps its own
//! dialect and decides which of them to use.

use crate::error::{ConfigError, Result};
use crate::parse::TableParser;
use crate::platform::{Plan, PrivilegeLevel, Step};

/// Exec commands that must never appear inside a configuration payload.
const EXEC_ONLY: &[&str] = &[
    "reload", "write", "copy", "erase", "configure", "delete", "debug", "undebug", "clear",
];

/// Paging marker printed by IOS, IOS-XE and NX-OS.
pub(super) const MORE_PATTERN: &str = r"\s?--More--\s?";

/// `exec` (`>`), `privilege_exec` (`#`) and `configuration` (`(config*)#`).
///
/// `host` is the character class allowed in a hostname.
pub(super) fn privilege_levels(host: &str) -> [PrivilegeLevel; 3] {
    let exec = PrivilegeLevel::new("exec", &format!(r"(?im)^{host}{{1,63}}>\s?$")).unwrap();

    let privilege_exec = PrivilegeLevel::new("privilege_exec", &format!(r"(?im)^{host}{{1,63}}#\s?$"))
        .unwrap()
        .with_parent("exec")
        .with_escalate("enable")
        .with_deescalate("disable")
        .with_auth(r"(?im)^(?:enable\s)?password:\s?$")
        .unwrap()
        .with_not_contains("(conf");

    let configuration = PrivilegeLevel::new(
        "configuration",
        &format!(r"(?im)^{host}{{1,63}}\(conf[\w.\-@/:+]{{0,63}}\)#\s?$"),
    )
    .unwrap()
    .with_parent("privilege_exec")
    .with_escalate("configure terminal")
    .with_deescalate("end");

    [exec, privilege_exec, configuration]
}

/// Printed after a multi-line `banner` command, before the banner text.
const BANNER_PROMPT: &str = r"End with the character";

/// One unit of line-oriented configuration.
#[derive(Debug, PartialEq)]
enum Entry<'a> {
    Line { number: usize, text: &'a str },
    /// `banner <kind> <delim>`, its text lines and the line carrying the
    /// closing delimiter (`None` if the payload ends first).
    Banner {
        number: usize,
        header: &'a str,
        delim: &'a str,
        text: Vec<&'a str>,
        close: Option<&'a str>,
    },
}

/// Delimiter of a `banner <kind> <delim>...` line and whether the banner
/// closes on the same line. `show running-config` prints the delimiter as
/// `^C`.
fn banner_delimiter(line: &str) -> Option<(&str, bool)> {
    let rest = line.trim().strip_prefix("banner")?;
    let rest = rest.strip_prefix(char::is_whitespace)?.trim_start();
    let body = rest[rest.find(char::is_whitespace)?..].trim_start();
    let width = if body.starts_with("^C") {
        2
    } else {
        body.chars().next()?.len_utf8()
    };
    let (delim, text) = body.split_at(width);
    Some((delim, text.contains(delim)))
}

fn entries(payload: &str) -> Vec<Entry<'_>> {
    let mut out = Vec::new();
    let mut lines = payload.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') {
            continue;
        }
        match banner_delimiter(line) {
            Some((delim, false)) => {
                let mut text = Vec::new();
                let mut close = None;
                for (_, next) in lines.by_ref() {
                    if next.contains(delim) {
                        close = Some(next.trim_end());
                        break;
                    }
                    text.push(next.trim_end_matches('\r'));
                }
                out.push(Entry::Banner {
                    number: idx + 1,
                    header: line.trim_end(),
                    delim,
                    text,
                    close,
                });
            }
            _ => out.push(Entry::Line {
                number: idx + 1,
                text: line,
            }),
        }
    }
    out
}

/// Syntax pre-check for line-oriented configuration.
pub(super) fn validate_lines(payload: &str) -> Result<()> {
    let mut errors = Vec::new();

    if payload.trim().is_empty() {
        errors.push("payload is empty".to_string());
    }

    for entry in entries(payload) {
        let (n, line) = match entry {
            Entry::Line { number, text } => (number, text),
            Entry::Banner {
                number,
                delim,
                text,
                close,
                ..
            } => {
                if close.is_none() {
                    errors.push(format!("line {number}: banner is not closed with '{delim}'"));
                }
                if text.iter().any(|l| l.chars().any(|c| c.is_control() && c != '\t')) {
                    errors.push(format!("line {number}: banner text contains control characters"));
                }
                continue;
            }
        };

        if line.chars().any(|c| c.is_control() && c != '\t' && c != '\r') {
            errors.push(format!("line {n}: contains control characters"));
            continue;
        }

        let first = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if first == "end" {
            errors.push(format!("line {n}: 'end' would leave configuration mode"));
        } else if EXEC_ONLY.contains(&first.as_str()) {
            errors.push(format!("line {n}: '{first}' is an exec command"));
        } else if first == "banner" {
            errors.push(format!("line {n}: banner needs a delimiter"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation { errors }.into())
    }
}

/// One `Command` step per configuration line; comments and blanks skipped.
///
/// A multi-line banner is entered as one exchange: the header waits for the
/// text prompt, the text is written as is and the closing line waits for
/// the configuration prompt again.
pub(super) fn line_plan(payload: &str) -> Plan {
    let mut plan = Vec::new();
    for entry in entries(payload) {
        match entry {
            Entry::Line { text, .. } => plan.push(Step::command(text.trim_end())),
            Entry::Banner {
                header, text, close, ..
            } => {
                plan.push(Step::Expect {
                    command: header.to_string(),
                    pattern: BANNER_PROMPT.to_string(),
                });
                plan.extend(text.iter().map(|l| Step::Write(l.to_string())));
                if let Some(close) = close {
                    plan.push(Step::command(close));
                }
            }
        }
    }
    plan
}

/// Drop the banner lines `show running-config` prints before the
/// configuration and the closing `end`.
pub(super) fn strip_running_config(output: &str, header_prefixes: &[&str]) -> String {
    let mut lines: Vec<&str> = output
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| {
            l.trim().is_empty() || header_prefixes.iter().any(|p| l.starts_with(p))
        })
        .collect();

    while lines
        .last()
        .is_some_and(|l| l.trim().is_empty() || l.trim() == "end")
    {
        lines.pop();
    }

    lines.join("\n")
}

/// `show ip interface brief`.
pub(super) fn interfaces_brief() -> TableParser {
    TableParser::new(
        r"^(?P<interface>\S+)\s+(?P<ip_address>\S+)\s+(?P<ok>YES|NO)\s+(?P<method>\S+)\s+(?P<status>up|down|administratively down|deleted)\s+(?P<protocol>up|down)\s*$",
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_lines_accepts_config() {
        let payload = "hostname core-1\n!\ninterface GigabitEthernet0/1\n description uplink\n no shutdown\n";
        assert!(validate_lines(payload).is_ok());
    }

    #[test]
    fn test_validate_lines_rejects_exec_and_end() {
        let err = validate_lines("hostname x\nreload\nend").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("line 2: 'reload' is an exec command"));
        assert!(message.contains("line 3: 'end'"));
        assert_eq!(err.kind(), "ConfigValidationError");
    }

    #[test]
    fn test_validate_lines_banners() {
        assert!(validate_lines("banner motd ^Authorized access only^").is_ok());
        assert!(validate_lines("banner motd ^C\nAuthorized\n^C").is_ok());
        assert!(validate_lines("banner login #\nreload is scheduled\n#\nhostname x").is_ok());

        let err = validate_lines("hostname x\nbanner motd ^C\nAuthorized\n").unwrap_err();
        assert!(err.to_string().contains("line 2: banner is not closed with '^C'"));
        assert!(validate_lines("banner motd").is_err());
        assert!(validate_lines("   \n").is_err());
    }

    #[test]
    fn test_banner_in_running_config() {
        let output = "Building configuration...\n\nCurrent configuration : 90 bytes\n!\nhostname core-1\n!\nbanner motd ^C\nAuthorized access only\n^C\n!\nend\n";
        let config = strip_running_config(output, &["Building configuration", "Current configuration"]);
        assert!(validate_lines(&config).is_ok());

        let plan = line_plan(&config);
        assert_eq!(
            plan,
            vec![
                Step::command("hostname core-1"),
                Step::Expect {
                    command: "banner motd ^C".to_string(),
                    pattern: BANNER_PROMPT.to_string(),
                },
                Step::Write("Authorized access only".to_string()),
                Step::command("^C"),
            ]
        );
    }

    #[test]
    fn test_banner_delimiter() {
        assert_eq!(banner_delimiter("banner motd ^C"), Some(("^C", false)));
        assert_eq!(banner_delimiter("banner exec #hi#"), Some(("#", true)));
        assert_eq!(banner_delimiter("banner motd"), None);
        assert_eq!(banner_delimiter("hostname banner"), None);
    }

    #[test]
    fn test_strip_running_config() {
        let output = "Building configuration...\n\nCurrent configuration : 120 bytes\n!\nhostname core-1\n!\nend\n";
        assert_eq!(
            strip_running_config(output, &["Building configuration", "Current configuration"]),
            "!\nhostname core-1\n!"
        );
    }

    #[test]
    fn test_cisco_prompts() {
        let [exec, priv_exec, config] = privilege_levels(r"[\w.\-@/:]");
        assert!(exec.matches("core-1>"));
        assert!(priv_exec.matches("core-1#"));
        assert!(!priv_exec.matches("core-1(config)#"));
        assert!(config.matches("core-1(config)#"));
        assert!(config.matches("core-1(config-if)#"));
        assert!(!config.matches("core-1#"));
    }
}
