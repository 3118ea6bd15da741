use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use super::{Broker, BrokerConsumer, CommitMode, DeliveryTag, Event, OutboundMessage, TopicSpec};
use crate::error::BrokerError;

// ============================================================================
// In-process broker
// ============================================================================
//
// Partitioned append-only logs with per-group cursors. Keyed messages hash to
// a fixed partition, so one key is always read in produce order. Consumers in
// the same group share the group cursor (each message goes to one of them);
// a new group starts at the end of the log.
//
// Outage hooks let tests simulate a producer outage or a dead cluster.
//
// ============================================================================

const DEFAULT_PARTITIONS: usize = 3;

struct TopicLog {
    partitions: Vec<Vec<Event>>,
    round_robin: usize,
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            round_robin: 0,
        }
    }

    fn end_offsets(&self) -> Vec<usize> {
        self.partitions.iter().map(Vec::len).collect()
    }
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicLog>,
    /// (topic, group) -> next offset per partition
    cursors: HashMap<(String, String), Vec<usize>>,
    /// (topic, group, partition) -> last committed offset + 1
    committed: HashMap<(String, String, i32), i64>,
}

impl BrokerState {
    fn topic_mut(&mut self, name: &str) -> &mut TopicLog {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(DEFAULT_PARTITIONS))
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    produce_unavailable: AtomicBool,
    disconnected: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                produce_unavailable: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    /// Make every produce fail with a transient send error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared
            .produce_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Simulate losing every broker: polls fail with `Unreachable`.
    pub fn disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Every message ever produced to `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<Event> {
        lock(&self.shared)
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, topic: &str, group_id: &str, partition: i32) -> Option<i64> {
        lock(&self.shared)
            .committed
            .get(&(topic.to_string(), group_id.to_string(), partition))
            .copied()
    }

    fn partition_for(key: Option<&str>, log: &mut TopicLog) -> usize {
        let count = log.partitions.len();
        match key.filter(|k| !k.is_empty()) {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                log.round_robin = (log.round_robin + 1) % count;
                log.round_robin
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("in-memory broker disconnected".into()));
        }
        if self.shared.produce_unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Send("broker unavailable".into()));
        }

        {
            let mut state = lock(&self.shared);
            let log = state.topic_mut(&message.topic);
            let partition = Self::partition_for(message.key.as_deref(), log);
            let offset = log.partitions[partition].len() as i64;
            let event = Event::received(
                message.topic,
                message.key,
                message.payload,
                message.headers,
                Some(DeliveryTag {
                    partition: partition as i32,
                    offset,
                }),
            );
            log.partitions[partition].push(event);
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        commit: CommitMode,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("in-memory broker disconnected".into()));
        }

        {
            let mut state = lock(&self.shared);
            let start = state.topic_mut(topic).end_offsets();
            state
                .cursors
                .entry((topic.to_string(), group_id.to_string()))
                .or_insert(start);
        }

        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            commit,
            closed: false,
        }))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        state
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| TopicLog::new(spec.partitions.max(1) as usize));
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        state.topics.remove(topic);
        state.cursors.retain(|(t, _), _| t != topic);
        state.committed.retain(|(t, _, _), _| t != topic);
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        Ok(lock(&self.shared).topics.keys().cloned().collect())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    group_id: String,
    commit: CommitMode,
    closed: bool,
}

impl MemoryConsumer {
    fn try_take(&self) -> Result<Option<Event>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("in-memory broker disconnected".into()));
        }

        let mut state = lock(&self.shared);
        let state = &mut *state;
        let Some(log) = state.topics.get(&self.topic) else {
            return Ok(None);
        };
        let cursor = state
            .cursors
            .entry((self.topic.clone(), self.group_id.clone()))
            .or_insert_with(|| log.end_offsets());
        cursor.resize(log.partitions.len(), 0);

        for (partition, messages) in log.partitions.iter().enumerate() {
            let next = cursor[partition];
            if let Some(event) = messages.get(next) {
                cursor[partition] = next + 1;
                let event = event.clone();
                if matches!(self.commit, CommitMode::Auto { .. }) {
                    state.committed.insert(
                        (self.topic.clone(), self.group_id.clone(), partition as i32),
                        next as i64 + 1,
                    );
                }
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_take()? {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, event: &Event) -> Result<(), BrokerError> {
        let Some(delivery) = event.delivery else {
            return Ok(());
        };
        lock(&self.shared).committed.insert(
            (self.topic.clone(), self.group_id.clone(), delivery.partition),
            delivery.offset + 1,
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
