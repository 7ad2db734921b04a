use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("line not found: {0}")]
    LineNotFound(String),
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("line already exists: {0}")]
    LineExists(String),
    #[error("message not delivered: {0}")]
    NotDelivered(u64),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("no message")]
    NoMessage,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("queue closed")]
    Closed,
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
