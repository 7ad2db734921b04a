//! Consumer lines.
//!
//! A line is an independent cursor over a topic. Every offset moves through
//!
//! ```text
//! unclaimed (>= cursor) -> in-flight (deadline) -> confirmed
//!                               |
//!                               +-- deadline passed, scanned -> recycled -> in-flight
//! ```
//!
//! Recycled offsets stay in the in-flight map; they are handed out again by
//! the next `pop`, ahead of fresh offsets, which resets their deadline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::deadline_after;
use crate::record::LineRecord;
use crate::{Error, Result};

#[derive(Debug)]
pub struct Line {
    name: String,
    recycle: Duration,
    state: Mutex<LineState>,
}

#[derive(Debug, Default)]
struct LineState {
    cursor: u64,
    inflight: BTreeMap<u64, u64>,
    recycled: BTreeSet<u64>,
}

/// Point-in-time copy of a line's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSnapshot {
    pub cursor: u64,
    pub inflight: usize,
    pub recycled: usize,
    /// Lowest offset this line may still deliver.
    pub low_water: u64,
}

impl Line {
    pub fn new(name: impl Into<String>, cursor: u64, recycle: Duration) -> Self {
        Self {
            name: name.into(),
            recycle,
            state: Mutex::new(LineState {
                cursor,
                ..LineState::default()
            }),
        }
    }

    /// Rebuild a line from its persisted record.
    ///
    /// In-flight entries at or beyond `tail` refer to messages that were never
    /// durably pushed and are dropped.
    pub fn from_record(name: impl Into<String>, record: &LineRecord, tail: u64) -> Self {
        let name = name.into();
        let cursor = record.cursor.min(tail);
        let mut inflight = BTreeMap::new();
        for &(offset, deadline) in &record.inflight {
            if offset < cursor {
                inflight.insert(offset, deadline);
            } else {
                log::warn!("line[{name}] drops in-flight offset {offset} beyond cursor {cursor}");
            }
        }
        Self {
            name,
            recycle: record.recycle,
            state: Mutex::new(LineState {
                cursor,
                inflight,
                recycled: BTreeSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recycle_timeout(&self) -> Duration {
        self.recycle
    }

    /// Claim the next offset for delivery.
    ///
    /// Recycled offsets go first, lowest first; otherwise the cursor advances
    /// if it is behind `tail`. Claiming and tracking happen under one lock, so
    /// concurrent pops never receive the same fresh offset.
    pub fn pop(&self, tail: u64, now_ns: u64) -> Result<u64> {
        let mut state = self.lock()?;
        let offset = if let Some(offset) = state.recycled.pop_first() {
            offset
        } else if state.cursor < tail {
            let offset = state.cursor;
            state.cursor += 1;
            offset
        } else {
            return Err(Error::NoMessage);
        };

        if self.recycle.is_zero() {
            state.inflight.remove(&offset);
        } else {
            state
                .inflight
                .insert(offset, deadline_after(now_ns, self.recycle));
        }
        Ok(offset)
    }

    /// Hand back an offset claimed by `pop` whose payload could not be read,
    /// so the next pop delivers it again.
    pub fn release(&self, offset: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.cursor == offset + 1 {
            state.cursor = offset;
            state.inflight.remove(&offset);
        } else {
            state.recycled.insert(offset);
        }
        Ok(())
    }

    /// Acknowledge an in-flight offset.
    pub fn confirm(&self, offset: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.inflight.remove(&offset).is_none() {
            return Err(Error::NotDelivered(offset));
        }
        state.recycled.remove(&offset);
        Ok(())
    }

    /// Mark every in-flight offset whose deadline is at or before `now_ns` as
    /// eligible for redelivery. Returns how many became newly eligible.
    pub fn recycle(&self, now_ns: u64) -> Result<usize> {
        let mut state = self.lock()?;
        let LineState {
            inflight, recycled, ..
        } = &mut *state;
        let mut count = 0;
        for (&offset, &deadline) in inflight.iter() {
            if deadline <= now_ns && recycled.insert(offset) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn snapshot(&self) -> Result<LineSnapshot> {
        let state = self.lock()?;
        let low_water = [
            state.inflight.keys().next().copied(),
            state.recycled.first().copied(),
        ]
        .into_iter()
        .flatten()
        .fold(state.cursor, u64::min);
        Ok(LineSnapshot {
            cursor: state.cursor,
            inflight: state.inflight.len(),
            recycled: state.recycled.len(),
            low_water,
        })
    }

    /// Copy the persistent fields. The lock is released before the caller
    /// encodes or writes anything.
    pub fn to_record(&self) -> Result<LineRecord> {
        let state = self.lock()?;
        Ok(LineRecord {
            cursor: state.cursor,
            recycle: self.recycle,
            inflight: state
                .inflight
                .iter()
                .map(|(&offset, &deadline)| (offset, deadline))
                .collect(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LineState>> {
        self.state
            .lock()
            .map_err(|_| Error::Poisoned("line state"))
    }
}
