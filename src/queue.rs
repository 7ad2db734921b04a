//! The queue engine: registry of topics and the entry point for every
//! administrative and delivery call.
//!
//! The topic map sits behind one engine-wide mutex that is only held to
//! look a topic up or to change the set of topics, which for removal
//! includes purging the old topic's keys. Push, pop and confirm
//! resolve their topic and release the engine lock before doing any work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::record::{EngineRecord, TopicRecord};
use crate::store::{topic_key, Storage, ENGINE_BACKUP_KEY, ENGINE_KEY};
use crate::topic::{Message, QueueStat, Topic};
use crate::{Error, Result};

/// Creates a topic when `line` is empty, otherwise a line on `topic`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub topic: String,
    pub line: String,
    /// Only meaningful for lines. Zero disables recycling.
    pub recycle: Duration,
}

impl CreateRequest {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn line(topic: impl Into<String>, line: impl Into<String>, recycle: Duration) -> Self {
        Self {
            topic: topic.into(),
            line: line.into(),
            recycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub topic: String,
    pub line: String,
    pub offset: u64,
}

impl ConfirmRequest {
    pub fn new(topic: impl Into<String>, line: impl Into<String>, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            line: line.into(),
            offset,
        }
    }
}

pub struct Queue {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    closed: AtomicBool,
}

impl Queue {
    /// Open the engine over `store`, recovering every topic and line it can.
    pub fn open(store: Arc<dyn Storage>, config: QueueConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn Storage>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Self {
            topics: Mutex::new(HashMap::new()),
            store,
            clock,
            config,
            closed: AtomicBool::new(false),
        };
        queue.load_queue()?;
        Ok(queue)
    }

    /// Rebuild topics from storage and start their workers.
    ///
    /// A missing, unreadable or corrupt engine record means an empty queue.
    /// Topic records that are missing or corrupt are skipped so one bad
    /// record cannot keep the broker down.
    fn load_queue(&self) -> Result<()> {
        let data = match self.store.get(ENGINE_KEY) {
            Ok(Some(data)) => data,
            Ok(None) => {
                log::info!("no queue record found, starting empty");
                return Ok(());
            }
            Err(err) => {
                log::error!("queue record read error, starting empty: {err}");
                return Ok(());
            }
        };
        let record = match EngineRecord::decode(&data) {
            Ok(record) => record,
            Err(err) => {
                log::error!("queue record decode error, starting empty: {err}");
                self.keep_corrupt_engine_record(&data);
                return Ok(());
            }
        };

        let mut topics = self.lock_topics()?;
        for name in record.topics {
            let topic_record = match self.load_topic_record(&name) {
                Ok(topic_record) => topic_record,
                Err(err) => {
                    log::warn!("topic[{name}] skipped: {err}");
                    continue;
                }
            };
            let topic = Topic::load(
                name.clone(),
                &topic_record,
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                self.config,
            );
            if let Err(err) = topic.start() {
                log::warn!("topic[{name}] skipped: worker failed to start: {err}");
                continue;
            }
            log::debug!("topic[{name}] load succ: {topic:?}");
            topics.insert(name, topic);
        }

        log::info!("queue load finished, {} topics", topics.len());
        Ok(())
    }

    /// The next topic creation rewrites the engine record, so the bad copy
    /// is saved first for offline repair.
    fn keep_corrupt_engine_record(&self, data: &[u8]) {
        match self.store.set(ENGINE_BACKUP_KEY, data) {
            Ok(()) => log::warn!("corrupt queue record saved under {ENGINE_BACKUP_KEY}"),
            Err(err) => log::error!("saving corrupt queue record failed: {err}"),
        }
    }

    fn load_topic_record(&self, name: &str) -> Result<TopicRecord> {
        let data = self
            .store
            .get(&topic_key(name))?
            .ok_or(Error::Corrupt("topic record missing"))?;
        TopicRecord::decode(&data)
    }

    pub fn create(&self, request: &CreateRequest) -> Result<()> {
        self.check_open()?;
        let mut topics = self.lock_topics()?;

        if !request.line.is_empty() {
            // Registered topic names are always valid, so the lookup alone
            // decides the topic half.
            let topic = topics
                .get(&request.topic)
                .ok_or_else(|| Error::TopicNotFound(request.topic.clone()))?;
            validate_name(&request.line)?;
            let result = topic.create_line(&request.line, request.recycle);
            if let Err(err) = &result {
                log::warn!("create line[{}/{}] error: {err}", request.topic, request.line);
            }
            result
        } else if !request.topic.is_empty() {
            validate_name(&request.topic)?;
            let result = self.create_topic(&mut topics, &request.topic);
            if let Err(err) = &result {
                log::warn!("create topic[{}] error: {err}", request.topic);
            }
            result
        } else {
            Err(Error::InvalidKey(String::new()))
        }
    }

    /// The topic record and the engine record are both written before the
    /// topic becomes visible; any failure rolls the topic back.
    fn create_topic(&self, topics: &mut HashMap<String, Arc<Topic>>, name: &str) -> Result<()> {
        if topics.contains_key(name) {
            return Err(Error::TopicExists(name.to_string()));
        }

        let topic = Topic::new(
            name,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config,
        );
        topic.export_topic()?;
        if let Err(err) = topic.start() {
            self.discard_topic_record(name);
            return Err(err);
        }
        topics.insert(name.to_string(), Arc::clone(&topic));

        if let Err(err) = self.export_queue(topics) {
            topics.remove(name);
            topic.stop();
            self.discard_topic_record(name);
            return Err(err);
        }

        log::info!("topic[{name}] created");
        Ok(())
    }

    fn discard_topic_record(&self, name: &str) {
        if let Err(err) = self.store.del(&topic_key(name)) {
            log::warn!("topic[{name}] rollback delete failed: {err}");
        }
    }

    fn export_queue(&self, topics: &HashMap<String, Arc<Topic>>) -> Result<()> {
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        let record = EngineRecord { topics: names };
        self.store.set(ENGINE_KEY, &record.encode())
    }

    /// Append `payload` to `topic` and return its offset.
    pub fn push(&self, topic: &str, payload: &[u8]) -> Result<u64> {
        self.check_open()?;
        self.topic(topic)?.push(payload)
    }

    /// Deliver the next message of `"topic/line"`.
    pub fn pop(&self, key: &str) -> Result<Message> {
        self.check_open()?;
        let (topic, line) = match split_key(key)? {
            (topic, Some(line)) => (topic, line),
            (_, None) => return Err(Error::InvalidKey(key.to_string())),
        };
        let topic = self.topic(topic).inspect_err(|_| {
            log::debug!("pop {key}: topic not found");
        })?;
        topic.pop(line)
    }

    pub fn confirm(&self, request: &ConfirmRequest) -> Result<()> {
        self.check_open()?;
        self.topic(&request.topic)?
            .confirm(&request.line, request.offset)
    }

    /// Remove `"topic"` or `"topic/line"` together with its stored state.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let (name, line) = split_key(key)?;
        if let Some(line) = line {
            return self.topic(name)?.remove_line(line);
        }

        // The engine lock stays held until the old keys are gone, so a topic
        // recreated under the same name cannot have its keys purged.
        let mut topics = self.lock_topics()?;
        let topic = topics
            .remove(name)
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))?;
        if let Err(err) = self.export_queue(&topics) {
            topics.insert(name.to_string(), topic);
            return Err(err);
        }

        topic.stop();
        topic.purge()?;
        log::info!("topic[{name}] removed");
        Ok(())
    }

    /// Counters for `"topic"` or `"topic/line"`.
    pub fn stat(&self, key: &str) -> Result<QueueStat> {
        self.check_open()?;
        let (name, line) = split_key(key)?;
        let topic = self.topic(name)?;
        match line {
            Some(line) => topic.line_stat(line),
            None => topic.stat(),
        }
    }

    /// Sorted topic names.
    pub fn topics(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock_topics()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Stop every worker, export every topic best-effort, then close storage.
    ///
    /// Export failures are logged per topic and do not stop the shutdown.
    /// Later calls return `Error::Closed`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("queue stopping...");

        let topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for topic in topics.values() {
            topic.stop();
        }

        let mut failed = 0;
        for (name, topic) in topics.iter() {
            if let Err(err) = topic.export_lines() {
                log::error!("topic[{name}] export lines error: {err}");
                failed += 1;
            }
            if let Err(err) = topic.export_topic() {
                log::error!("topic[{name}] export error: {err}");
                failed += 1;
            }
        }
        if failed == 0 {
            log::info!("export all topics succ.");
        }

        self.store.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.lock_topics()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn lock_topics(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Topic>>>> {
        self.topics
            .lock()
            .map_err(|_| Error::Poisoned("queue topics"))
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("queue close on drop failed: {err}");
        }
    }
}

/// Split `"topic"` or `"topic/line"`; every segment must be a valid name.
fn split_key(key: &str) -> Result<(&str, Option<&str>)> {
    let mut parts = key.split('/');
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(topic), None, None) => (topic, None),
        (Some(topic), Some(line), None) => (topic, Some(line)),
        _ => return Err(Error::InvalidKey(key.to_string())),
    };
    if !is_valid_name(parsed.0) || !parsed.1.map_or(true, is_valid_name) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(parsed)
}

fn validate_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidKey(name.to_string()))
    }
}

/// Names become storage keys, so they may not contain the key separators.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', ':']) && name != ENGINE_KEY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_accepts_topic_and_line() {
        assert_eq!(split_key("t").ok(), Some(("t", None)));
        assert_eq!(split_key("t/l").ok(), Some(("t", Some("l"))));
    }

    #[test]
    fn split_key_rejects_malformed_paths() {
        for key in ["", "/", "t/", "/l", "t/l/x", "t:1", "t/l:2"] {
            assert!(
                matches!(split_key(key), Err(Error::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn engine_key_is_not_a_topic_name() {
        assert!(!is_valid_name(ENGINE_KEY));
        assert!(is_valid_name("orders"));
    }
}
