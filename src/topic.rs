//! Topics: the append-only message log and the lines reading it.
//!
//! Each topic owns one maintenance thread that periodically exports its
//! metadata and scans its lines for expired in-flight messages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::line::Line;
use crate::record::{LineRecord, TopicRecord};
use crate::store::{line_key, message_key, topic_key, Storage};
use crate::{Error, Result};

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatKind {
    Topic,
    Line,
}

/// Counters reported by `Queue::stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStat {
    pub name: String,
    pub kind: StatKind,
    pub lines: Vec<String>,
    #[serde(rename = "recycle_ms", with = "crate::config::millis")]
    pub recycle: Duration,
    pub head: u64,
    pub inflight: usize,
    pub tail: u64,
    pub count: u64,
}

/// Outcome of one recycle pass over a topic's lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: usize,
    pub recycled: usize,
    /// Lines left for the next pass because the time budget ran out.
    pub deferred: usize,
}

#[derive(Debug)]
struct TopicState {
    head: u64,
    tail: u64,
}

pub struct Topic {
    name: String,
    state: Mutex<TopicState>,
    lines: RwLock<BTreeMap<String, Arc<Line>>>,
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    scan_resume: Mutex<Option<String>>,
    worker: Mutex<Option<Worker>>,
}

impl Topic {
    /// An empty topic. The worker is not running until `start`.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Self::with_lines(name.into(), 0, 0, BTreeMap::new(), store, clock, config)
    }

    /// Rebuild a topic and its lines from storage.
    ///
    /// A line whose record is missing, unreadable or corrupt is skipped; the
    /// rest of the topic still loads. Deadlines that expired while the broker
    /// was down are recycled straight away.
    pub fn load(
        name: impl Into<String>,
        record: &TopicRecord,
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let now = clock.now();
        let tail = recover_tail(store.as_ref(), &name, record.tail);
        let mut lines = BTreeMap::new();
        for line_name in &record.lines {
            let key = line_key(&name, line_name);
            let line_record = match load_line_record(store.as_ref(), &key) {
                Ok(line_record) => line_record,
                Err(err) => {
                    log::warn!("line[{key}] skipped: {err}");
                    continue;
                }
            };
            let line = Line::from_record(line_name.clone(), &line_record, tail);
            match line.recycle(now) {
                Ok(0) => {}
                Ok(expired) => log::info!("line[{key}] has {expired} expired in-flight messages"),
                Err(err) => log::warn!("line[{key}] recycle after load failed: {err}"),
            }
            log::debug!("line[{key}] load succ.");
            lines.insert(line_name.clone(), Arc::new(line));
        }
        Self::with_lines(name, record.head, tail, lines, store, clock, config)
    }

    fn with_lines(
        name: String,
        head: u64,
        tail: u64,
        lines: BTreeMap<String, Arc<Line>>,
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(TopicState { head, tail }),
            lines: RwLock::new(lines),
            store,
            clock,
            config,
            scan_resume: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tail(&self) -> Result<u64> {
        Ok(self.lock_state()?.tail)
    }

    /// Sorted names of the registered lines.
    pub fn line_names(&self) -> Result<Vec<String>> {
        Ok(self.read_lines()?.keys().cloned().collect())
    }

    /// Append a payload and return its offset.
    ///
    /// The state lock is held across the payload write so offsets are handed
    /// out in push order. `tail` only moves once the write succeeded.
    pub fn push(&self, payload: &[u8]) -> Result<u64> {
        let mut state = self.lock_state()?;
        let offset = state.tail;
        self.store.set(&message_key(&self.name, offset), payload)?;
        state.tail += 1;
        Ok(offset)
    }

    /// Register a line starting at the current tail. The line record and the
    /// topic record are written before returning; on a failed write the line
    /// is unregistered again.
    pub fn create_line(&self, name: &str, recycle: Duration) -> Result<()> {
        let tail = self.tail()?;
        let line = {
            let mut lines = self.write_lines()?;
            if lines.contains_key(name) {
                return Err(Error::LineExists(name.to_string()));
            }
            let line = Arc::new(Line::new(name, tail, recycle));
            lines.insert(name.to_string(), Arc::clone(&line));
            line
        };

        let key = line_key(&self.name, name);
        let persisted = self
            .export_line(&line)
            .and_then(|()| self.export_topic());
        if let Err(err) = persisted {
            self.write_lines()?.remove(name);
            if let Err(del_err) = self.store.del(&key) {
                log::warn!("line[{key}] rollback delete failed: {del_err}");
            }
            return Err(err);
        }

        log::info!("line[{key}] created, cursor {tail}, recycle {recycle:?}");
        Ok(())
    }

    /// Unregister a line and delete its record.
    pub fn remove_line(&self, name: &str) -> Result<()> {
        let line = self
            .write_lines()?
            .remove(name)
            .ok_or_else(|| Error::LineNotFound(name.to_string()))?;

        if let Err(err) = self.export_topic() {
            self.write_lines()?.insert(name.to_string(), line);
            return Err(err);
        }

        let key = line_key(&self.name, name);
        if let Err(err) = self.store.del(&key) {
            log::warn!("line[{key}] record delete failed: {err}");
        }
        log::info!("line[{key}] removed");
        Ok(())
    }

    pub fn pop(&self, line_name: &str) -> Result<Message> {
        let line = self.line(line_name)?;
        let tail = self.tail()?;
        let offset = line.pop(tail, self.clock.now())?;
        match self.store.get(&message_key(&self.name, offset)) {
            Ok(Some(payload)) => Ok(Message { offset, payload }),
            // A payload that is gone will not come back; the offset stays consumed.
            Ok(None) => Err(Error::Corrupt("message payload missing")),
            Err(err) => {
                line.release(offset)?;
                Err(err)
            }
        }
    }

    pub fn confirm(&self, line_name: &str, offset: u64) -> Result<()> {
        self.line(line_name)?.confirm(offset)
    }

    /// Recycle expired in-flight messages across all lines.
    ///
    /// Lines are visited in name order starting where the previous pass
    /// stopped. Once `budget` is spent the remaining lines wait for the next
    /// pass; at least one line is always scanned.
    pub fn recycle_lines(&self, budget: Duration) -> Result<ScanStats> {
        let started = Instant::now();
        let lines: Vec<Arc<Line>> = self.read_lines()?.values().cloned().collect();
        let mut resume = self
            .scan_resume
            .lock()
            .map_err(|_| Error::Poisoned("topic scan resume"))?;

        let start = match resume.take() {
            Some(name) => lines.iter().position(|line| line.name() >= name.as_str()).unwrap_or(0),
            None => 0,
        };

        let mut stats = ScanStats::default();
        let order = (start..lines.len()).chain(0..start);
        let total = lines.len();
        for (visited, index) in order.enumerate() {
            let line = &lines[index];
            let now = self.clock.now();
            stats.recycled += line.recycle(now)?;
            stats.scanned += 1;

            if visited + 1 < total && started.elapsed() >= budget {
                let next = &lines[(index + 1) % total];
                *resume = Some(next.name().to_string());
                stats.deferred = total - visited - 1;
                break;
            }
        }
        Ok(stats)
    }

    /// Write every line record. All lines are attempted; the first failure is
    /// returned.
    pub fn export_lines(&self) -> Result<()> {
        let lines: Vec<Arc<Line>> = self.read_lines()?.values().cloned().collect();
        let mut first_err = None;
        for line in lines {
            if let Err(err) = self.export_line(&line) {
                log::error!("line[{}/{}] export error: {err}", self.name, line.name());
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Write the topic record.
    pub fn export_topic(&self) -> Result<()> {
        let record = self.to_record()?;
        self.store.set(&topic_key(&self.name), &record.encode())
    }

    /// Export lines then the topic record, attempting both.
    pub fn export(&self) -> Result<()> {
        let lines = self.export_lines();
        let topic = self.export_topic();
        lines.and(topic)
    }

    /// Snapshot the persistent fields, advancing `head` to the lowest offset
    /// any line can still deliver.
    pub fn to_record(&self) -> Result<TopicRecord> {
        let lines: Vec<Arc<Line>> = self.read_lines()?.values().cloned().collect();
        let mut low_water = None::<u64>;
        for line in &lines {
            let snapshot = line.snapshot()?;
            low_water = Some(low_water.map_or(snapshot.low_water, |low| low.min(snapshot.low_water)));
        }

        let mut state = self.lock_state()?;
        let head = low_water.unwrap_or(state.tail).min(state.tail);
        state.head = state.head.max(head);
        Ok(TopicRecord {
            head: state.head,
            tail: state.tail,
            lines: lines.iter().map(|line| line.name().to_string()).collect(),
        })
    }

    pub fn stat(&self) -> Result<QueueStat> {
        let record = self.to_record()?;
        let mut inflight = 0;
        for line in self.read_lines()?.values() {
            inflight += line.snapshot()?.inflight;
        }
        Ok(QueueStat {
            name: self.name.clone(),
            kind: StatKind::Topic,
            lines: record.lines,
            recycle: Duration::ZERO,
            head: record.head,
            inflight,
            tail: record.tail,
            count: record.tail - record.head,
        })
    }

    pub fn line_stat(&self, line_name: &str) -> Result<QueueStat> {
        let line = self.line(line_name)?;
        let snapshot = line.snapshot()?;
        let tail = self.tail()?;
        Ok(QueueStat {
            name: line_key(&self.name, line_name),
            kind: StatKind::Line,
            lines: Vec::new(),
            recycle: line.recycle_timeout(),
            head: snapshot.cursor,
            inflight: snapshot.inflight,
            tail,
            count: tail.saturating_sub(snapshot.cursor),
        })
    }

    /// Delete every key this topic owns. Failures are logged and skipped.
    pub fn purge(&self) -> Result<()> {
        let tail = self.tail()?;
        for name in self.line_names()? {
            let key = line_key(&self.name, &name);
            if let Err(err) = self.store.del(&key) {
                log::warn!("line[{key}] delete failed: {err}");
            }
        }
        for offset in 0..tail {
            if let Err(err) = self.store.del(&message_key(&self.name, offset)) {
                log::warn!("topic[{}] message {offset} delete failed: {err}", self.name);
            }
        }
        if let Err(err) = self.store.del(&topic_key(&self.name)) {
            log::warn!("topic[{}] record delete failed: {err}", self.name);
        }
        Ok(())
    }

    /// Spawn the maintenance thread. Calling `start` on a running topic is a
    /// no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| Error::Poisoned("topic worker"))?;
        if worker.is_some() {
            return Ok(());
        }
        *worker = Some(Worker::spawn(Arc::clone(self))?);
        Ok(())
    }

    /// Signal the maintenance thread and wait for it to exit.
    pub fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn export_line(&self, line: &Line) -> Result<()> {
        let record = line.to_record()?;
        self.store
            .set(&line_key(&self.name, line.name()), &record.encode())
    }

    fn line(&self, name: &str) -> Result<Arc<Line>> {
        self.read_lines()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::LineNotFound(name.to_string()))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TopicState>> {
        self.state
            .lock()
            .map_err(|_| Error::Poisoned("topic state"))
    }

    fn read_lines(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Line>>>> {
        self.lines
            .read()
            .map_err(|_| Error::Poisoned("topic lines"))
    }

    fn write_lines(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Line>>>> {
        self.lines
            .write()
            .map_err(|_| Error::Poisoned("topic lines"))
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("tail", &self.tail().ok())
            .field("lines", &self.line_names().unwrap_or_default())
            .finish()
    }
}

/// Pushes made after the last export are stored but not yet counted in the
/// record's tail. Probe forward so they are neither lost nor overwritten.
fn recover_tail(store: &dyn Storage, topic: &str, recorded: u64) -> u64 {
    let mut tail = recorded;
    loop {
        match store.get(&message_key(topic, tail)) {
            Ok(Some(_)) => tail += 1,
            Ok(None) => break,
            Err(err) => {
                log::warn!("topic[{topic}] tail probe at {tail} failed: {err}");
                break;
            }
        }
    }
    if tail != recorded {
        log::info!("topic[{topic}] recovered tail {recorded} -> {tail}");
    }
    tail
}

fn load_line_record(store: &dyn Storage, key: &str) -> Result<LineRecord> {
    let data = store
        .get(key)?
        .ok_or(Error::Corrupt("line record missing"))?;
    LineRecord::decode(&data)
}

struct Worker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(topic: Arc<Topic>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("uq-topic-{}", topic.name))
            .spawn(move || run_maintenance(&topic, &thread_shutdown))?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_maintenance(topic: &Topic, shutdown: &AtomicBool) {
    let config = topic.config;
    let started = Instant::now();
    let mut next_backup = started + config.backup_interval;
    let mut next_clean = started + config.clean_interval;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        if now >= next_backup {
            if let Err(err) = topic.export() {
                log::error!("topic[{}] backup error: {err}", topic.name);
            }
            next_backup = Instant::now() + config.backup_interval;
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        if now >= next_clean {
            match topic.recycle_lines(config.clean_timeout) {
                Ok(stats) if stats.deferred > 0 => log::warn!(
                    "topic[{}] recycle scan over budget, {} lines deferred",
                    topic.name,
                    stats.deferred
                ),
                Ok(stats) if stats.recycled > 0 => log::debug!(
                    "topic[{}] recycled {} messages",
                    topic.name,
                    stats.recycled
                ),
                Ok(_) => {}
                Err(err) => log::error!("topic[{}] recycle error: {err}", topic.name),
            }
            next_clean = Instant::now() + config.clean_interval;
        }

        let wake = next_backup.min(next_clean);
        let now = Instant::now();
        if wake > now {
            thread::park_timeout(wake - now);
        }
    }
    log::debug!("topic[{}] worker stopped", topic.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn topic_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Arc<Topic> {
        Topic::new("orders", store, clock, QueueConfig::default())
    }

    #[test]
    fn push_assigns_consecutive_offsets() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(Arc::clone(&store), Arc::new(ManualClock::new(0)));
        assert_eq!(topic.push(b"a")?, 0);
        assert_eq!(topic.push(b"b")?, 1);
        assert_eq!(topic.tail()?, 2);
        assert_eq!(store.get("orders:1")?, Some(b"b".to_vec()));
        Ok(())
    }

    #[test]
    fn failed_push_keeps_tail() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(Arc::clone(&store), Arc::new(ManualClock::new(0)));
        topic.push(b"a")?;
        store.close()?;
        assert!(matches!(topic.push(b"b"), Err(Error::Closed)));
        assert_eq!(topic.tail()?, 1);
        Ok(())
    }

    #[test]
    fn new_line_starts_at_tail() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(Arc::clone(&store), Arc::new(ManualClock::new(0)));
        topic.push(b"old")?;
        topic.create_line("audit", Duration::ZERO)?;
        assert!(matches!(topic.pop("audit"), Err(Error::NoMessage)));
        topic.push(b"new")?;
        assert_eq!(
            topic.pop("audit")?,
            Message {
                offset: 1,
                payload: b"new".to_vec()
            }
        );
        assert!(matches!(
            topic.create_line("audit", Duration::ZERO),
            Err(Error::LineExists(_))
        ));
        assert!(store.get("orders/audit")?.is_some());
        assert!(store.get("orders")?.is_some());
        Ok(())
    }

    #[test]
    fn head_follows_slowest_line() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(store, Arc::new(ManualClock::new(0)));
        assert_eq!(topic.to_record()?.head, 0);
        topic.create_line("fast", Duration::from_secs(1))?;
        topic.create_line("slow", Duration::from_secs(1))?;
        for payload in [b"a", b"b", b"c"] {
            topic.push(payload)?;
        }
        for _ in 0..3 {
            let message = topic.pop("fast")?;
            topic.confirm("fast", message.offset)?;
        }
        topic.pop("slow")?;
        let record = topic.to_record()?;
        assert_eq!((record.head, record.tail), (0, 3));

        topic.confirm("slow", 0)?;
        assert_eq!(topic.to_record()?.head, 1);
        Ok(())
    }

    #[test]
    fn recycle_scan_respects_budget_and_resumes() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let topic = topic_with(store, Arc::clone(&clock));
        for name in ["a", "b", "c"] {
            topic.create_line(name, Duration::from_secs(1))?;
        }
        topic.push(b"m")?;
        for name in ["a", "b", "c"] {
            topic.pop(name)?;
        }
        clock.advance(Duration::from_secs(2));

        let first = topic.recycle_lines(Duration::ZERO)?;
        assert_eq!(first, ScanStats { scanned: 1, recycled: 1, deferred: 2 });
        let second = topic.recycle_lines(Duration::ZERO)?;
        assert_eq!(second, ScanStats { scanned: 1, recycled: 1, deferred: 2 });
        let full = topic.recycle_lines(Duration::from_secs(60))?;
        assert_eq!(full, ScanStats { scanned: 3, recycled: 1, deferred: 0 });

        for name in ["a", "b", "c"] {
            assert_eq!(topic.pop(name)?.offset, 0);
        }
        Ok(())
    }

    /// Memory store whose reads can be switched to fail.
    #[derive(Default)]
    struct UnreadableStore {
        inner: MemoryStore,
        fail_gets: AtomicBool,
    }

    impl Storage for UnreadableStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.fail_gets.load(Ordering::Acquire) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected read failure",
                )));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            self.inner.set(key, value)
        }

        fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key)
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn failed_payload_read_keeps_offset_for_next_pop() -> Result<()> {
        let store = Arc::new(UnreadableStore::default());
        let topic = Topic::new(
            "orders",
            Arc::clone(&store) as Arc<dyn Storage>,
            Arc::new(ManualClock::new(0)),
            QueueConfig::default(),
        );
        topic.create_line("audit", Duration::ZERO)?;
        topic.push(b"a")?;

        store.fail_gets.store(true, Ordering::Release);
        assert!(matches!(topic.pop("audit"), Err(Error::Io(_))));
        store.fail_gets.store(false, Ordering::Release);

        assert_eq!(
            topic.pop("audit")?,
            Message {
                offset: 0,
                payload: b"a".to_vec()
            }
        );
        Ok(())
    }

    #[test]
    fn remove_line_deletes_record() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(Arc::clone(&store), Arc::new(ManualClock::new(0)));
        topic.create_line("audit", Duration::ZERO)?;
        topic.remove_line("audit")?;
        assert!(store.get("orders/audit")?.is_none());
        assert!(matches!(topic.pop("audit"), Err(Error::LineNotFound(_))));
        assert!(matches!(topic.remove_line("audit"), Err(Error::LineNotFound(_))));
        Ok(())
    }

    #[test]
    fn worker_starts_and_stops() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let topic = topic_with(store, Arc::new(ManualClock::new(0)));
        topic.start()?;
        topic.start()?;
        assert!(topic.is_running());
        topic.stop();
        assert!(!topic.is_running());
        topic.stop();
        Ok(())
    }
}
