//! Persistent at-least-once message queue.
//!
//! Producers push to named topics. Each topic has any number of lines,
//! independent consumer cursors that must confirm what they pop; anything
//! left unconfirmed past the line's recycle timeout is delivered again.
//! Topic and line metadata survive restart through a [`store::Storage`]
//! adapter.

pub mod clock;
pub mod config;
pub mod error;
pub mod line;
pub mod queue;
pub mod record;
pub mod store;
pub mod topic;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::{Error, Result};
pub use queue::{ConfirmRequest, CreateRequest, Queue};
pub use store::{FileStore, MemoryStore, Storage};
pub use topic::{Message, QueueStat, StatKind};
