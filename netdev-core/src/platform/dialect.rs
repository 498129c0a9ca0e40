//! CLI dialect: prompts, privilege levels, paging and failure strings.

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::bytes::Regex;

use super::privilege_level::PrivilegeLevel;
use crate::channel::patterns::{combine_patterns, generic_prompt};
use crate::error::{CommandError, Result};

/// One hop between privilege levels.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Level reached by this hop.
    pub to: String,
    /// Command that performs the hop.
    pub command: String,
    /// Password prompt that may appear (escalation only).
    pub auth_prompt: Option<Regex>,
}

/// Everything about a vendor CLI that is data rather than behaviour.
#[derive(Clone)]
pub struct Dialect {
    /// Platform name (e.g., "cisco_ios", "juniper_junos").
    pub name: String,

    /// Privilege levels for this platform.
    pub privilege_levels: IndexMap<String, PrivilegeLevel>,

    /// Level commands are run from.
    pub default_privilege: String,

    /// Level configuration lines are sent from.
    pub config_privilege: String,

    /// Substrings that mark a command as failed.
    pub failed_when_contains: Vec<String>,

    /// Commands run once per new session (paging and width suppression).
    pub on_open_commands: Vec<String>,

    /// Pager prompt answered with a space and removed from output.
    pub paging_pattern: Option<Regex>,

    prompt: OnceLock<Regex>,
}

impl Dialect {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            privilege_levels: IndexMap::new(),
            default_privilege: String::new(),
            config_privilege: String::new(),
            failed_when_contains: vec![],
            on_open_commands: vec![],
            paging_pattern: None,
            prompt: OnceLock::new(),
        }
    }

    /// Add a privilege level.
    pub fn with_privilege(mut self, level: PrivilegeLevel) -> Self {
        self.privilege_levels.insert(level.name.clone(), level);
        self.prompt = OnceLock::new();
        self
    }

    /// Set the level commands run from.
    pub fn with_default_privilege(mut self, name: impl Into<String>) -> Self {
        self.default_privilege = name.into();
        self
    }

    /// Set the configuration level.
    pub fn with_config_privilege(mut self, name: impl Into<String>) -> Self {
        self.config_privilege = name.into();
        self
    }

    /// Add a failure pattern.
    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failed_when_contains.push(pattern.into());
        self
    }

    /// Add an on_open command.
    pub fn with_on_open_command(mut self, command: impl Into<String>) -> Self {
        self.on_open_commands.push(command.into());
        self
    }

    /// Set the pager pattern.
    pub fn with_paging(mut self, pattern: &str) -> std::result::Result<Self, regex::Error> {
        self.paging_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Regex matching the prompt of any privilege level.
    pub fn prompt_pattern(&self) -> &Regex {
        self.prompt.get_or_init(|| {
            combine_patterns(self.privilege_levels.values().map(|l| l.pattern.as_str()))
                .unwrap_or_else(|_| generic_prompt())
        })
    }

    /// Determine the privilege level from a prompt string.
    pub fn determine_level(&self, prompt: &str) -> Option<&PrivilegeLevel> {
        self.privilege_levels.values().find(|l| l.matches(prompt))
    }

    /// Whether `prompt` belongs to the configuration level.
    pub fn is_config_prompt(&self, prompt: &str) -> bool {
        self.determine_level(prompt)
            .is_some_and(|l| l.name == self.config_privilege)
    }

    /// First failure substring found in `output`.
    pub fn detect_failure(&self, output: &str) -> Option<String> {
        self.failed_when_contains
            .iter()
            .find(|p| output.contains(p.as_str()))
            .cloned()
    }

    fn ancestors(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut current = name;
        while let Some(parent) = self
            .privilege_levels
            .get(current)
            .and_then(|l| l.previous_priv.as_deref())
        {
            // Guard against cyclic definitions
            if chain.iter().any(|c| c == parent) {
                break;
            }
            chain.push(parent.to_string());
            current = parent;
        }
        chain
    }

    /// Hops needed to move from `from` to `to`: de-escalate up to the common
    /// ancestor, then escalate down.
    pub fn path(&self, from: &str, to: &str) -> Result<Vec<Transition>> {
        if !self.privilege_levels.contains_key(from) || !self.privilege_levels.contains_key(to) {
            return Err(CommandError::PrivilegeAcquisitionFailed {
                target: to.to_string(),
            }
            .into());
        }

        let up = self.ancestors(from);
        let down = self.ancestors(to);
        let common = up
            .iter()
            .find(|l| down.contains(l))
            .cloned()
            .ok_or_else(|| CommandError::PrivilegeAcquisitionFailed {
                target: to.to_string(),
            })?;

        let mut hops = Vec::new();
        for name in up.iter().take_while(|l| **l != common) {
            let level = &self.privilege_levels[name.as_str()];
            let parent = level.previous_priv.clone().unwrap_or_default();
            let command = level.deescalate_command.clone().ok_or_else(|| {
                CommandError::PrivilegeAcquisitionFailed { target: parent.clone() }
            })?;
            hops.push(Transition {
                to: parent,
                command,
                auth_prompt: None,
            });
        }

        let descend: Vec<&String> = down.iter().take_while(|l| **l != common).collect();
        for name in descend.into_iter().rev() {
            let level = &self.privilege_levels[name.as_str()];
            let command = level.escalate_command.clone().ok_or_else(|| {
                CommandError::PrivilegeAcquisitionFailed {
                    target: name.clone(),
                }
            })?;
            hops.push(Transition {
                to: name.clone(),
                command,
                auth_prompt: level.escalate_prompt.clone(),
            });
        }

        Ok(hops)
    }
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect")
            .field("name", &self.name)
            .field("privilege_levels", &self.privilege_levels.keys().collect::<Vec<_>>())
            .field("default_privilege", &self.default_privilege)
            .field("config_privilege", &self.config_privilege)
            .field("failed_when_contains", &self.failed_when_contains)
            .field("on_open_commands", &self.on_open_commands)
            .finish()
    }
}
