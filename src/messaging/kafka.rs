use async_trait::async_trait;
use indexmap::IndexMap;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode as KafkaCommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

use super::{Broker, BrokerConsumer, CommitMode, DeliveryTag, Event, OutboundMessage, TopicSpec};
use crate::error::BrokerError;

// ============================================================================
// Kafka / Redpanda backend
// ============================================================================
//
// One FutureProducer shared process-wide, one StreamConsumer per
// subscription. Consumers start at the latest offset for new groups and read
// only committed transactional data.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub message_timeout: Duration,
    pub session_timeout: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            message_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(6),
        }
    }
}

pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaBroker {
    pub fn connect(settings: KafkaSettings) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", settings.message_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| BrokerError::Unreachable(format!("failed to create producer: {}", e)))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .create()
            .map_err(|e| BrokerError::Admin(format!("failed to create admin client: {}", e)))?;

        tracing::info!(brokers = %settings.brokers, "✅ Kafka producer created");

        Ok(Self {
            settings,
            producer,
            admin,
        })
    }
}

fn classify(err: KafkaError, wrap: fn(String) -> BrokerError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::Unreachable(err.to_string()),
        _ => wrap(err.to_string()),
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (name, value) in &message.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(key) = message.key.as_deref().filter(|k| !k.is_empty()) {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(self.settings.message_timeout))
            .await
            .map_err(|(e, _)| classify(e, BrokerError::Send))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        commit: CommitMode,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "latest")
            .set("isolation.level", "read_committed")
            .set(
                "session.timeout.ms",
                self.settings.session_timeout.as_millis().to_string(),
            );

        match commit {
            CommitMode::Auto { interval } => {
                config
                    .set("enable.auto.commit", "true")
                    .set("auto.commit.interval.ms", interval.as_millis().to_string());
            }
            CommitMode::Manual => {
                config.set("enable.auto.commit", "false");
            }
        }

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| classify(e, BrokerError::Poll))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| classify(e, BrokerError::Poll))?;

        tracing::info!(topic = %topic, group_id = %group_id, "Kafka consumer subscribed");

        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
        }))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let results = self
            .admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| classify(e, BrokerError::Admin))?;

        for result in results {
            match result {
                Ok(name) => tracing::info!(topic = %name, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    tracing::debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!("create {}: {}", name, code)))
                }
            }
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let results = self
            .admin
            .delete_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| classify(e, BrokerError::Admin))?;

        for result in results {
            match result {
                Ok(name) => tracing::info!(topic = %name, "Topic deleted"),
                Err((name, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    tracing::debug!(topic = %name, "Topic already absent")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!("delete {}: {}", name, code)))
                }
            }
        }
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.settings.message_timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, timeout)
        })
        .await
        .map_err(|e| BrokerError::Admin(e.to_string()))?
        .map_err(|e| classify(e, BrokerError::Admin))?;

        let mut topics: Vec<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .filter(|name| !name.starts_with("__"))
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Send(e.to_string()))?
            .map_err(|e| classify(e, BrokerError::Send))
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, BrokerError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(classify(e, BrokerError::Poll)),
            Ok(Ok(message)) => message,
        };

        let mut headers = IndexMap::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                let value = header
                    .value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                headers.insert(header.key.to_string(), value);
            }
        }

        let key = message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned());
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        let delivery = DeliveryTag {
            partition: message.partition(),
            offset: message.offset(),
        };

        Ok(Some(Event::received(
            message.topic(),
            key,
            payload,
            headers,
            Some(delivery),
        )))
    }

    async fn commit(&mut self, event: &Event) -> Result<(), BrokerError> {
        let Some(delivery) = event.delivery else {
            return Ok(());
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&event.topic, delivery.partition, Offset::Offset(delivery.offset + 1))
            .map_err(|e| BrokerError::Commit(e.to_string()))?;

        self.consumer
            .commit(&offsets, KafkaCommitMode::Async)
            .map_err(|e| classify(e, BrokerError::Commit))
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        tracing::info!(topic = %self.topic, "Kafka consumer closed");
    }
}
