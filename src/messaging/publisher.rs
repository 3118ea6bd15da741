use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;
use uuid::Uuid;

use super::{Broker, OutboundMessage, TopicSpec};
use crate::context::{RequestContext, HEADER_MESSAGE_ID, HEADER_TIMESTAMP};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerError};

// ============================================================================
// Event Publisher
// ============================================================================
//
// Stamps reserved headers and hands the message to the broker through the
// producer circuit breaker. Success means the broker accepted the message,
// not that it is durable.
//
// Headers:
// - message_id  generated (UUID v4) unless the caller set one
// - timestamp   publish time in unix nanoseconds unless the caller set one
// - tenant_id   copied from the request context when present
// - trace_id    copied from the request context when present
//
// ============================================================================

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub key: Option<String>,
    pub headers: IndexMap<String, String>,
}

impl PublishOptions {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            headers: IndexMap::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, breaker: CircuitBreaker, span: Span) -> Self {
        Self {
            broker,
            breaker,
            metrics: None,
            span,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Publish `payload` to `topic`. Returns the message id.
    pub async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<String> {
        let PublishOptions { key, mut headers } = options;

        let message_id = headers
            .entry(HEADER_MESSAGE_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        headers
            .entry(HEADER_TIMESTAMP.to_string())
            .or_insert_with(|| Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string());
        ctx.write_headers(&mut headers);

        let message = OutboundMessage {
            topic: topic.to_string(),
            key: key.clone(),
            payload,
            headers,
        };

        match self.breaker.call(self.broker.produce(message)).await {
            Ok(()) => {
                self.record(topic, Ok(()));
                tracing::debug!(
                    parent: &self.span,
                    topic = %topic,
                    key = key.as_deref().unwrap_or(""),
                    message_id = %message_id,
                    tenant_id = ctx.tenant(),
                    "Published event"
                );
                Ok(message_id)
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                self.record(topic, Err("circuit_open"));
                tracing::error!(
                    parent: &self.span,
                    topic = %topic,
                    "Circuit breaker open - broker unavailable"
                );
                Err(Error::CircuitOpen(self.breaker.name().to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                self.record(topic, Err("send_failed"));
                tracing::error!(
                    parent: &self.span,
                    topic = %topic,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e.into())
            }
        }
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<String> {
        let payload = serde_json::to_vec(value)?;
        self.publish(ctx, topic, payload, options).await
    }

    pub async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        self.broker.create_topic(spec).await?;
        Ok(())
    }

    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.broker.delete_topic(topic).await?;
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.broker.list_topics().await?)
    }

    /// Flush buffered publishes, bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.broker.flush(timeout)).await {
            Ok(Ok(())) => {
                tracing::info!(parent: &self.span, "Publisher flushed and closed");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(parent: &self.span, error = %e, "Publisher flush failed");
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    parent: &self.span,
                    timeout_ms = timeout.as_millis() as u64,
                    "Publisher flush timed out"
                );
                Err(Error::TransientBroker("flush timed out".into()))
            }
        }
    }

    fn record(&self, topic: &str, outcome: std::result::Result<(), &str>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(topic, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HEADER_TENANT_ID, HEADER_TRACE_ID};
    use crate::messaging::MemoryBroker;
    use crate::utils::CircuitBreakerConfig;

    fn publisher(broker: &MemoryBroker) -> EventPublisher {
        EventPublisher::new(
            Arc::new(broker.clone()),
            CircuitBreaker::new("producer", CircuitBreakerConfig::default()),
            tracing::info_span!("publisher-test"),
        )
    }

    #[tokio::test]
    async fn test_publish_stamps_reserved_headers() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        let ctx = RequestContext::for_tenant("acme").with_trace("trace-9");

        let id = publisher
            .publish(&ctx, "product-events", b"{}".to_vec(), PublishOptions::keyed("p1"))
            .await
            .unwrap();

        let sent = broker.messages("product-events");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].key.as_deref(), Some("p1"));
        assert_eq!(sent[0].header(HEADER_TENANT_ID), Some("acme"));
        assert_eq!(sent[0].header(HEADER_TRACE_ID), Some("trace-9"));
        assert!(sent[0].published_at().is_some());
        assert_eq!(sent[0].attempt, 0);
    }

    #[tokio::test]
    async fn test_each_publish_gets_unique_id() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        let ctx = RequestContext::new();

        let a = publisher.publish(&ctx, "t", vec![1], PublishOptions::default()).await.unwrap();
        let b = publisher.publish(&ctx, "t", vec![1], PublishOptions::default()).await.unwrap();

        assert_ne!(a, b);
        assert!(broker.messages("t")[0].header(HEADER_TENANT_ID).is_none());
    }

    #[tokio::test]
    async fn test_caller_message_id_wins() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let id = publisher
            .publish(
                &RequestContext::new(),
                "t",
                vec![],
                PublishOptions::default().header(HEADER_MESSAGE_ID, "fixed-id"),
            )
            .await
            .unwrap();

        assert_eq!(id, "fixed-id");
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let publisher = publisher(&broker);

        let result = publisher
            .publish(&RequestContext::new(), "t", vec![], PublishOptions::default())
            .await;

        assert!(matches!(result, Err(Error::TransientBroker(_))));
        assert!(broker.messages("t").is_empty());
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let publisher = EventPublisher::new(
            Arc::new(broker.clone()),
            CircuitBreaker::new(
                "producer",
                CircuitBreakerConfig {
                    failure_threshold: 2,
                    ..CircuitBreakerConfig::default()
                },
            ),
            tracing::info_span!("publisher-test"),
        );
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let _ = publisher.publish(&ctx, "t", vec![], PublishOptions::default()).await;
        }
        let result = publisher.publish(&ctx, "t", vec![], PublishOptions::default()).await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_close_flushes() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        assert!(publisher.close(DEFAULT_CLOSE_TIMEOUT).await.is_ok());
    }
}
