//! Juniper Junos support.

mod handler;
mod platform;

pub use handler::JuniperHandler;
pub use platform::{DIALECT_NAME, dialect};
