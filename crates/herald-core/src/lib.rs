//! Foundational low-level utilities shared across Herald crates.
//!
//! Provides atomic file-write helpers and time utilities used by policy,
//! command, and telemetry persistence.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
