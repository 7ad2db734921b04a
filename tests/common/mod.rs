#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use uqueue::{Error, ManualClock, MemoryStore, Message, Queue, QueueConfig, Result, Storage};

/// Intervals short enough for the worker to tick many times per test.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        backup_interval: Duration::from_millis(20),
        clean_interval: Duration::from_millis(10),
        clean_timeout: Duration::from_millis(50),
    }
}

/// Intervals long enough that the worker never ticks during a test.
pub fn idle_config() -> QueueConfig {
    QueueConfig {
        backup_interval: Duration::from_secs(3600),
        clean_interval: Duration::from_secs(3600),
        clean_timeout: Duration::from_secs(1),
    }
}

pub fn open_queue(store: Arc<dyn Storage>, config: QueueConfig, clock: Arc<ManualClock>) -> Queue {
    Queue::with_clock(store, config, clock).expect("open queue")
}

/// Pops until a message arrives or five seconds pass.
pub fn pop_eventually(queue: &Queue, key: &str) -> Message {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match queue.pop(key) {
            Ok(message) => return message,
            Err(Error::NoMessage) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("pop {key}: {err}"),
        }
    }
}

/// Memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_sets: AtomicBool,
}

impl FlakyStore {
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::Release);
    }
}

impl Storage for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_sets.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.set(key, value)
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
