//! Channel layer for pattern matching and PTY operations.
//!
//! This module handles the interactive side of a session: prompt and paging
//! detection on a tail-searched buffer, with ANSI escapes stripped.

mod buffer;
pub mod patterns;
mod pty;

pub use buffer::PatternBuffer;
pub use pty::CliChannel;
