//! Shared error hierarchy and small helpers for tmbridge.

pub mod error;
pub mod util;

pub use error::{BridgeError, ConfigError};
pub use util::preview;
