//! Structured output parsers.
//!
//! Parsers are selected by a string key on the command request. A parser
//! that does not recognise the output returns `None`; the executor then
//! hands back raw text only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::{Map, Value};

/// Turns normalized command output into structured data.
pub trait OutputParser: Send + Sync {
    fn parse(&self, output: &str) -> Option<Value>;
}

impl<F> OutputParser for F
where
    F: Fn(&str) -> Option<Value> + Send + Sync,
{
    fn parse(&self, output: &str) -> Option<Value> {
        self(output)
    }
}

/// Parses the whole output as JSON (`| json`, `| display json`).
pub struct JsonParser;

impl OutputParser for JsonParser {
    fn parse(&self, output: &str) -> Option<Value> {
        let trimmed = output.trim();
        let start = trimmed.find(['{', '['])?;
        serde_json::from_str(&trimmed[start..]).ok()
    }
}

/// Applies one regex with named groups to every line; each matching line
/// becomes an object keyed by group name.
pub struct TableParser {
    row: Regex,
}

impl TableParser {
    pub fn new(row: &str) -> Result<Self, regex::Error> {
        Ok(Self { row: Regex::new(row)? })
    }
}

impl OutputParser for TableParser {
    fn parse(&self, output: &str) -> Option<Value> {
        let names: Vec<&str> = self.row.capture_names().flatten().collect();
        let rows: Vec<Value> = output
            .lines()
            .filter_map(|line| self.row.captures(line))
            .map(|caps| {
                let mut row = Map::new();
                for name in &names {
                    if let Some(m) = caps.name(name) {
                        row.insert((*name).to_string(), Value::String(m.as_str().to_string()));
                    }
                }
                Value::Object(row)
            })
            .collect();

        if rows.is_empty() { None } else { Some(Value::Array(rows)) }
    }
}

/// Extracts named scalar fields, each with its own regex (first capture group).
pub struct FieldsParser {
    fields: Vec<(String, Regex)>,
}

impl FieldsParser {
    pub fn new<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, regex::Error> {
        let fields = fields
            .into_iter()
            .map(|(name, pattern)| Ok((name.to_string(), Regex::new(pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { fields })
    }
}

impl OutputParser for FieldsParser {
    fn parse(&self, output: &str) -> Option<Value> {
        let mut object = Map::new();
        for (name, pattern) in &self.fields {
            if let Some(value) = pattern.captures(output).and_then(|c| c.get(1)) {
                object.insert(name.clone(), Value::String(value.as_str().trim().to_string()));
            }
        }
        if object.is_empty() { None } else { Some(Value::Object(object)) }
    }
}

/// Caller-registered parsers, consulted before the handler's built-ins.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: RwLock<HashMap<String, Arc<dyn OutputParser>>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a parser.
    pub fn register(&self, key: impl Into<String>, parser: Arc<dyn OutputParser>) {
        self.parsers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), parser);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn OutputParser>> {
        self.parsers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}
