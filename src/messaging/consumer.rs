use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{Broker, BrokerConsumer, CommitMode, DeadLetterRecord, Event, EventPublisher, PublishOptions};
use crate::context::RequestContext;
use crate::error::{BrokerError, Error, Result};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Subscription Manager
// ============================================================================
//
// Each subscription owns one broker consumer and one tokio task running the
// consume loop:
//
//   poll (bounded) -> build RequestContext from headers -> handler with retry
//     -> success:   commit (manual mode)
//     -> exhausted: dead-letter record through the EventPublisher
//     -> permanent: dead-letter record without further attempts
//
// Cancellation tokens are children of the manager's root token. The loop
// checks its token at every poll boundary; unsubscribe and close wait for the
// loop with a bounded timeout and abort it if the wait runs out.
//
// The registry (subscription id -> handler + task) sits behind an async
// RwLock. Loops take read locks to fetch their handler; subscribe,
// unsubscribe and close take the write lock.
//
// ============================================================================

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, event: &Event) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(RequestContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, event: &Event) -> Result<()> {
        (self.0)(ctx.clone(), event.clone()).await
    }
}

/// Wrap an async closure as a handler. The closure receives owned copies.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(RequestContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Manager-wide defaults. Individual subscriptions may override them.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub commit: CommitMode,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub dead_letter_topic: Option<String>,
    pub poll_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: "catalog-events".to_string(),
            commit: CommitMode::default(),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            dead_letter_topic: None,
            poll_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub group_id: Option<String>,
    pub commit: Option<CommitMode>,
    pub max_retries: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub dead_letter_topic: Option<String>,
}

impl SubscriptionOptions {
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn commit(mut self, commit: CommitMode) -> Self {
        self.commit = Some(commit);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }
}

struct Registration {
    topic: String,
    group_id: String,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

type Registry = Arc<RwLock<HashMap<Uuid, Registration>>>;

pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    publisher: EventPublisher,
    settings: ConsumerSettings,
    registry: Registry,
    root: CancellationToken,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

impl SubscriptionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: EventPublisher,
        settings: ConsumerSettings,
        span: Span,
    ) -> Self {
        Self {
            broker,
            publisher,
            settings,
            registry: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
            metrics: None,
            span,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub async fn active_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Subscribe with the manager defaults.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        self.subscribe_with(topic, handler, SubscriptionOptions::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        if self.root.is_cancelled() {
            return Err(BrokerError::Closed.into());
        }

        let group_id = options
            .group_id
            .unwrap_or_else(|| self.settings.group_id.clone());
        let commit = options.commit.unwrap_or(self.settings.commit);
        let max_retries = options.max_retries.unwrap_or(self.settings.max_retries);
        if max_retries == 0 {
            return Err(Error::Configuration("max_retries must be at least 1".into()));
        }
        let backoff_base = options.backoff_base.unwrap_or(self.settings.backoff_base);
        let dead_letter_topic = options
            .dead_letter_topic
            .or_else(|| self.settings.dead_letter_topic.clone())
            .filter(|t| !t.is_empty());

        let consumer = self.broker.subscribe(topic, &group_id, commit).await?;

        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        let span = tracing::info_span!(
            parent: &self.span,
            "subscription",
            subscription_id = %id,
            topic = %topic,
            group_id = %group_id
        );

        self.registry.write().await.insert(
            id,
            Registration {
                topic: topic.to_string(),
                group_id: group_id.clone(),
                handler,
                cancel: cancel.clone(),
                task: None,
            },
        );

        let consume_loop = ConsumeLoop {
            id,
            topic: topic.to_string(),
            group_id: group_id.clone(),
            commit,
            retry: RetryConfig::exponential(max_retries, backoff_base),
            dead_letter_topic,
            poll_timeout: self.settings.poll_timeout,
            registry: self.registry.clone(),
            publisher: self.publisher.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
        };

        if let Some(metrics) = &self.metrics {
            metrics.active_subscriptions.inc();
        }
        let task = tokio::spawn(consume_loop.run(consumer).instrument(span.clone()));

        if let Some(registration) = self.registry.write().await.get_mut(&id) {
            registration.task = Some(task);
        }

        tracing::info!(parent: &span, max_retries = max_retries, "✅ Subscribed");

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            group_id,
            cancel,
            registry: self.registry.clone(),
            shutdown_timeout: self.settings.shutdown_timeout,
            span,
        })
    }

    /// Cancel every subscription, wait for the loops (bounded), then flush
    /// and close the publisher.
    pub async fn close(&self) -> Result<()> {
        tracing::info!(parent: &self.span, "🛑 Closing subscription manager");
        self.root.cancel();

        let drained: Vec<(Uuid, Registration)> = self.registry.write().await.drain().collect();
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut first_error = None;

        for (id, registration) in drained {
            if let Some(task) = registration.task {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if let Err(e) = join_bounded(task, remaining, &self.span, id).await {
                    first_error.get_or_insert(e);
                }
            }
            tracing::debug!(
                parent: &self.span,
                subscription_id = %id,
                topic = %registration.topic,
                group_id = %registration.group_id,
                "Subscription stopped"
            );
        }

        let flushed = self.publisher.close(self.settings.shutdown_timeout).await;
        match first_error {
            Some(e) => Err(e),
            None => flushed,
        }
    }
}

/// Handle returned by `subscribe`. Dropping it leaves the loop running.
pub struct Subscription {
    id: Uuid,
    topic: String,
    group_id: String,
    cancel: CancellationToken,
    registry: Registry,
    shutdown_timeout: Duration,
    span: Span,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Stop the loop and release its consumer. Once this returns the handler
    /// is never invoked again for this subscription, even on error.
    ///
    /// Fails when the loop panicked or had to be aborted after the shutdown
    /// timeout.
    pub async fn unsubscribe(self) -> Result<()> {
        self.cancel.cancel();

        let registration = self.registry.write().await.remove(&self.id);
        if let Some(Registration { cancel, task, .. }) = registration {
            cancel.cancel();
            if let Some(task) = task {
                join_bounded(task, self.shutdown_timeout, &self.span, self.id).await?;
            }
        }

        tracing::info!(parent: &self.span, "Unsubscribed");
        Ok(())
    }
}

async fn join_bounded(mut task: JoinHandle<()>, timeout: Duration, span: &Span, id: Uuid) -> Result<()> {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(parent: span, subscription_id = %id, error = %e, "Consumer loop ended abnormally");
            Err(Error::Subscription(format!("consumer loop {} ended abnormally: {}", id, e)))
        }
        Err(_) => {
            tracing::warn!(
                parent: span,
                subscription_id = %id,
                timeout_ms = timeout.as_millis() as u64,
                "Consumer loop did not stop in time, aborting"
            );
            task.abort();
            let _ = task.await;
            Err(Error::Subscription(format!(
                "consumer loop {} did not stop within {:?} and was aborted",
                id, timeout
            )))
        }
    }
}

enum Outcome {
    Success,
    DeadLettered,
    Dropped,
    Error,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Dropped => "dropped",
            Outcome::Error => "error",
        }
    }
}

struct ConsumeLoop {
    id: Uuid,
    topic: String,
    group_id: String,
    commit: CommitMode,
    retry: RetryConfig,
    dead_letter_topic: Option<String>,
    poll_timeout: Duration,
    registry: Registry,
    publisher: EventPublisher,
    metrics: Option<Arc<Metrics>>,
    cancel: CancellationToken,
}

impl ConsumeLoop {
    async fn run(self, mut consumer: Box<dyn BrokerConsumer>) {
        tracing::info!("Consumer loop started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = consumer.poll(self.poll_timeout) => polled,
            };

            let event = match polled {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "❌ Broker unreachable, stopping consumer loop");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed");
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                break;
            }

            let handler = match self.registry.read().await.get(&self.id) {
                Some(registration) => registration.handler.clone(),
                None => break,
            };

            self.deliver(event, handler, consumer.as_mut()).await;
        }

        consumer.close().await;
        // No-op when unsubscribe or close already took the registration.
        self.registry.write().await.remove(&self.id);
        if let Some(metrics) = &self.metrics {
            metrics.active_subscriptions.dec();
        }
        tracing::info!("Consumer loop stopped");
    }

    async fn deliver(
        &self,
        mut event: Event,
        handler: Arc<dyn MessageHandler>,
        consumer: &mut dyn BrokerConsumer,
    ) {
        let started = Instant::now();
        let ctx = RequestContext::from_headers(&event.headers);
        let span = tracing::debug_span!(
            "delivery",
            message_id = %event.id,
            tenant_id = ctx.tenant(),
            trace_id = ctx.trace()
        );

        let outcome = async {
            let result = retry_on_transient(&self.retry, |attempt| {
                let handler = handler.clone();
                let ctx = ctx.clone();
                let mut attempt_event = event.clone();
                attempt_event.attempt = attempt;
                if let Some(metrics) = &self.metrics {
                    metrics.record_handler_attempt(&self.topic, attempt);
                }
                async move { handler.handle(&ctx, &attempt_event).await }
            })
            .await;

            event.attempt = result.attempts();

            match result {
                RetryResult::Success { .. } => {
                    self.acknowledge(consumer, &event).await;
                    Outcome::Success
                }
                RetryResult::Exhausted { error, attempts } => {
                    self.escalate(consumer, &ctx, event, error, attempts, "exhausted")
                        .await
                }
                RetryResult::Permanent { error, attempts } => {
                    self.escalate(consumer, &ctx, event, error, attempts, "permanent")
                        .await
                }
            }
        }
        .instrument(span)
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_message(&self.topic, outcome.as_str(), started.elapsed().as_secs_f64());
        }
    }

    async fn acknowledge(&self, consumer: &mut dyn BrokerConsumer, event: &Event) {
        if self.commit != CommitMode::Manual {
            return;
        }
        if let Err(e) = consumer.commit(event).await {
            tracing::warn!(error = %e, "Failed to commit offset");
        }
    }

    /// Route a failed event to the dead-letter topic, or drop it when none is
    /// configured. If the dead-letter publish itself fails the message is
    /// logged at error level and dropped: its offset is not committed here,
    /// but the group position has already moved past it and the next commit
    /// on the partition covers it, so it is not redelivered.
    async fn escalate(
        &self,
        consumer: &mut dyn BrokerConsumer,
        ctx: &RequestContext,
        event: Event,
        error: Error,
        attempts: u32,
        reason: &str,
    ) -> Outcome {
        let Some(dead_letter_topic) = &self.dead_letter_topic else {
            tracing::error!(
                error = %error,
                attempts = attempts,
                group_id = %self.group_id,
                "Handler failed and no dead-letter topic is configured, dropping message"
            );
            self.acknowledge(consumer, &event).await;
            return Outcome::Dropped;
        };

        let key = event.key.clone();
        let message_id = event.id.clone();
        let record = DeadLetterRecord::new(event, error.to_string(), attempts);

        let published = self
            .publisher
            .publish_json(
                ctx,
                dead_letter_topic,
                &record,
                PublishOptions {
                    key,
                    ..PublishOptions::default()
                },
            )
            .await;

        match published {
            Ok(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_dead_letter(&self.topic, reason);
                }
                tracing::error!(
                    message_id = %message_id,
                    error = %record.error,
                    retry_count = attempts,
                    dead_letter_topic = %dead_letter_topic,
                    "💀 Message sent to dead-letter topic"
                );
                self.acknowledge(consumer, &record.original_message).await;
                Outcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message_id,
                    error = %e,
                    handler_error = %record.error,
                    "Failed to publish dead-letter record, dropping message"
                );
                Outcome::Error
            }
        }
    }
}
