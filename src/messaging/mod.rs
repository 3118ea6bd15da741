// ============================================================================
// Messaging
// ============================================================================
//
// Broker port plus the two components built on it:
//
// - EventPublisher: stamps headers and sends through a circuit breaker
// - SubscriptionManager: one consumer loop per subscription with bounded
//   retry, backoff and dead-lettering
//
// Backends: Kafka/Redpanda via rdkafka, and an in-process broker used for
// CATALOG_BACKEND=memory and the tests.
//
// ============================================================================

mod consumer;
mod event;
mod kafka;
mod memory;
mod publisher;

use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::Duration;

use crate::error::BrokerError;

pub use consumer::{
    handler_fn, ConsumerSettings, MessageHandler, Subscription, SubscriptionManager,
    SubscriptionOptions,
};
pub use event::{DeadLetterRecord, DeliveryTag, Event};
pub use kafka::{KafkaBroker, KafkaSettings};
pub use memory::MemoryBroker;
pub use publisher::{EventPublisher, PublishOptions, DEFAULT_CLOSE_TIMEOUT};

/// How consumed offsets are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// The client commits periodically in the background.
    Auto { interval: Duration },
    /// The loop commits each message after its handler succeeds.
    Manual,
}

impl Default for CommitMode {
    fn default() -> Self {
        CommitMode::Auto {
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// A fully stamped message ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: IndexMap<String, String>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        commit: CommitMode,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError>;

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    /// Wait for buffered produces to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send {
    /// `Ok(None)` when nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, BrokerError>;

    async fn commit(&mut self, event: &Event) -> Result<(), BrokerError>;

    async fn close(&mut self);
}
