//! Per-tenant emoji usage counters with periodic durable persistence.
//!
//! A thin collaborator of the command gateway: counts emoji references seen
//! in inbound messages, renders usage reports, and flushes snapshots to the
//! usage store on a timer owned by a single background task.

pub mod emoji_usage;
pub mod usage_autosave;
pub mod usage_store;

pub use emoji_usage::{extract_emoji_references, EmojiUsageCollector};
pub use usage_autosave::{start_usage_autosave, UsageAutosaveHandle};
pub use usage_store::{JsonUsageStore, UsageStore};
