//! Pattern buffer with efficient tail-search optimization.
//!
//! Only the last N bytes of the buffer are searched for prompt and paging
//! patterns, rather than the entire output. For large outputs (full BGP
//! tables, full running configs) this keeps each read O(search_depth).

use regex::bytes::Regex;

/// Buffer for accumulating output and efficiently searching for patterns.
#[derive(Debug)]
pub struct PatternBuffer {
    /// The accumulated output buffer.
    buffer: Vec<u8>,

    /// How many bytes from the end to search for patterns.
    search_depth: usize,
}

impl PatternBuffer {
    /// Create a new pattern buffer with the specified search depth.
    pub fn new(search_depth: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            search_depth,
        }
    }

    /// Extend the buffer with new data, stripping ANSI escape codes.
    pub fn extend(&mut self, data: &[u8]) {
        let cleaned = strip_ansi_escapes::strip(data);
        self.buffer.extend_from_slice(&cleaned);
    }

    fn tail_start(&self) -> usize {
        self.buffer.len().saturating_sub(self.search_depth)
    }

    /// Search only the tail of the buffer for the pattern.
    ///
    /// Offsets of the returned match are relative to the start of the
    /// search region, not the full buffer.
    pub fn search_tail(&self, pattern: &Regex) -> Option<regex::bytes::Match<'_>> {
        pattern.find(&self.buffer[self.tail_start()..])
    }

    /// Search the entire buffer for a pattern.
    pub fn search_full(&self, pattern: &Regex) -> Option<regex::bytes::Match<'_>> {
        pattern.find(&self.buffer)
    }

    /// Check if the tail contains a pattern match.
    pub fn tail_contains(&self, pattern: &Regex) -> bool {
        self.search_tail(pattern).is_some()
    }

    /// Remove the last match of `pattern` in the tail, along with any
    /// carriage-return / backspace padding the device wrote around it.
    ///
    /// Returns `true` if something was removed. Used for `--More--` style
    /// paging markers, which must never reach the caller.
    pub fn remove_tail_match(&mut self, pattern: &Regex) -> bool {
        let start = self.tail_start();
        let Some((m_start, m_end)) = pattern
            .find_iter(&self.buffer[start..])
            .last()
            .map(|m| (start + m.start(), start + m.end()))
        else {
            return false;
        };

        let mut end = m_end;
        while end < self.buffer.len() && matches!(self.buffer[end], b'\r' | b'\x08' | b' ') {
            end += 1;
        }
        self.buffer.drain(m_start..end);
        true
    }

    /// Take ownership of the buffer contents and reset.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop unread output before a new request.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
