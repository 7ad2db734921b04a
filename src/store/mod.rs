//! Byte-keyed storage adapters.
//!
//! The engine only relies on single-key atomicity: a `set` either replaces
//! the whole value or leaves the old one in place.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::Result;

pub trait Storage: Send + Sync {
    /// Returns `None` when the key has never been set or was deleted.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Deleting a missing key succeeds.
    fn del(&self, key: &str) -> Result<()>;
    /// After `close`, every call returns `Error::Closed`.
    fn close(&self) -> Result<()>;
}

/// Key of the engine record listing every topic.
pub const ENGINE_KEY: &str = "UnitedQueueKey";

/// Where an engine record that failed to decode is copied before the
/// engine rewrites `ENGINE_KEY`. Names cannot contain `:`, so no topic or
/// message key collides with it.
pub const ENGINE_BACKUP_KEY: &str = "UnitedQueueKey:corrupt";

pub fn topic_key(topic: &str) -> String {
    topic.to_string()
}

pub fn line_key(topic: &str, line: &str) -> String {
    format!("{topic}/{line}")
}

pub fn message_key(topic: &str, offset: u64) -> String {
    format!("{topic}:{offset}")
}
