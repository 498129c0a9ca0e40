//! Juniper Junos dialect.
//!
//! Two privilege levels matter for device management:
//! - `exec` - operational mode with `>` prompt
//! - `configuration` - configuration mode with `#` prompt
//!
//! Prompt patterns are adapted from [scrapli](https://github.com/carlmontanari/scrapli).
//!
//! # Prompt Examples
//!
//! ```text
//! user@router>              # exec mode
//! user@router#              # configuration mode
//! {master:0}                # routing-engine indicator (separate line)
//! user@router>              # exec prompt on next line
//! {master:0}[edit]          # config with routing-engine indicator
//! user@router#              # config prompt on next line
//! ```
//!
//! Configuration mode is entered with `configure exclusive` so that no other
//! user can modify the candidate while a transaction is staged.

use crate::platform::{Dialect, PrivilegeLevel};

pub const DIALECT_NAME: &str = "juniper_junos";

/// Junos pager (`---(more)---`, `---(more 42%)---`).
const MORE_PATTERN: &str = r"---\(more(?: \d+%)?\)---";

pub fn dialect() -> Dialect {
    let exec = PrivilegeLevel::new(
        "exec",
        r"(?mi)^(\{\w+(:(\w+)?\d)?\}\n)?[\w\-@()/:\.]{1,63}>\s?$",
    )
    .unwrap();

    let configuration = PrivilegeLevel::new(
        "configuration",
        r"(?mi)^(\{\w+(:(\w+)?\d)?\}\[edit\]\n)?[\w\-@()/:\.]{1,63}#\s?$",
    )
    .unwrap()
    .with_parent("exec")
    .with_escalate("configure exclusive")
    .with_deescalate("exit configuration-mode");

    Dialect::new(DIALECT_NAME)
        .with_privilege(exec)
        .with_privilege(configuration)
        .with_default_privilege("exec")
        .with_config_privilege("configuration")
        .with_failure_pattern("unknown command")
        .with_failure_pattern("syntax error")
        .with_failure_pattern("error:")
        .with_failure_pattern("missing argument")
        .with_failure_pattern("is ambiguous")
        .with_failure_pattern("No valid completions")
        .with_failure_pattern("missing mandatory argument")
        .with_failure_pattern("invalid numeric value")
        .with_on_open_command("set cli screen-length 0")
        .with_on_open_command("set cli screen-width 511")
        .with_on_open_command("set cli complete-on-space off")
        .with_paging(MORE_PATTERN)
        .unwrap()
}

/// Routing-engine indicators printed above the prompt.
const RE_INDICATORS: &[&str] = &["{master", "{backup", "{primary", "{linecard"];

fn is_context_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("[edit")
        || RE_INDICATORS.iter().any(|p| trimmed.starts_with(p))
}

/// Drop the `[edit ...]` and routing-engine lines printed around the prompt.
///
/// Only the edges of the output are touched: hierarchy headers inside a
/// `show | compare` body say which stanza a change belongs to.
pub fn strip_context_lines(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines
        .iter()
        .position(|l| {
            let trimmed = l.trim();
            !trimmed.is_empty() && !RE_INDICATORS.iter().any(|p| trimmed.starts_with(p))
        })
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !is_context_line(l))
        .map_or(start, |i| (i + 1).max(start));
    lines[start..end].join("\n")
}
