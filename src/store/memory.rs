use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::store::Storage;
use crate::{Error, Result};

/// Volatile storage backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of the stored keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .entries
            .lock()
            .map(|guard| guard.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// An independent store holding a copy of the current entries, as if
    /// the process had crashed at this point and restarted on the same data.
    pub fn snapshot(&self) -> MemoryStore {
        let entries = self
            .entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        MemoryStore {
            entries: Mutex::new(entries),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let guard = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("memory store"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("memory store"))?;
        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("memory store"))?;
        guard.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
