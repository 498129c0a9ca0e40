//! Pattern matching utilities for prompt detection.

use regex::bytes::Regex;

/// Combine several prompt patterns into one alternation.
///
/// Each pattern keeps its own inline flags by being wrapped in a
/// non-capturing group.
pub fn combine_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Regex, regex::Error> {
    let combined = patterns
        .into_iter()
        .map(|p| format!("(?:{})", p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&combined)
}

/// Compile a prompt pattern string, anchoring it to the end of the buffer
/// if it is not anchored already.
pub fn compile_prompt_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}\\s*$", pattern)
    };

    Regex::new(&pattern)
}

/// Fallback prompt used when a dialect cannot be compiled.
pub fn generic_prompt() -> Regex {
    Regex::new(r"[$#>%]\s*$").expect("static prompt pattern")
}
