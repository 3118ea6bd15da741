// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

// Re-export for public API
pub use server::{start_metrics_server, HealthProbe};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers the event core end to end:
// - Consumer loop throughput, latency, handler attempts
// - Dead-letter records
// - Publisher throughput, failures, and events lost after commit
// - Unit-of-work outcomes
// - Cache invalidation volume
// - Circuit breaker state and transitions
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Consumer Metrics
    pub messages_processed: IntCounterVec,
    pub message_processing_duration: HistogramVec,
    pub handler_attempts_total: IntCounterVec,
    pub active_subscriptions: IntGauge,

    // DLQ Metrics
    pub dead_letters_total: IntCounterVec,

    // Publisher Metrics
    pub events_published: IntCounterVec,
    pub publish_failures: IntCounterVec,
    pub events_lost_after_commit: IntCounterVec,

    // Storage Metrics
    pub units_of_work: IntCounterVec,

    // Cache Metrics
    pub cache_keys_invalidated: IntCounter,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_processed = IntCounterVec::new(
            Opts::new("worker_messages_processed_total", "Messages processed by consumer loops"),
            &["topic", "status"],
        )?;
        registry.register(Box::new(messages_processed.clone()))?;

        let message_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "worker_message_processing_duration_seconds",
                "Time from receipt to final outcome, retries included",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["topic"],
        )?;
        registry.register(Box::new(message_processing_duration.clone()))?;

        let handler_attempts_total = IntCounterVec::new(
            Opts::new("handler_attempts_total", "Handler invocations, first tries and retries"),
            &["topic", "attempt"],
        )?;
        registry.register(Box::new(handler_attempts_total.clone()))?;

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Subscriptions with a running consumer loop",
        )?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        let dead_letters_total = IntCounterVec::new(
            Opts::new("dead_letter_records_total", "Messages escalated to the dead-letter topic"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events accepted by the broker for delivery"),
            &["topic"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("publish_failures_total", "Publish calls that returned an error"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let events_lost_after_commit = IntCounterVec::new(
            Opts::new(
                "events_lost_after_commit_total",
                "Committed writes whose change event could not be published",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(events_lost_after_commit.clone()))?;

        let units_of_work = IntCounterVec::new(
            Opts::new("units_of_work_total", "Units of work by terminal outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(units_of_work.clone()))?;

        let cache_keys_invalidated = IntCounter::new(
            "cache_keys_invalidated_total",
            "Cache keys deleted by invalidation",
        )?;
        registry.register(Box::new(cache_keys_invalidated.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            messages_processed,
            message_processing_duration,
            handler_attempts_total,
            active_subscriptions,
            dead_letters_total,
            events_published,
            publish_failures,
            events_lost_after_commit,
            units_of_work,
            cache_keys_invalidated,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `status` is one of success, dead_lettered, dropped, error.
    pub fn record_message(&self, topic: &str, status: &str, duration_secs: f64) {
        self.messages_processed.with_label_values(&[topic, status]).inc();
        self.message_processing_duration
            .with_label_values(&[topic])
            .observe(duration_secs);
    }

    pub fn record_handler_attempt(&self, topic: &str, attempt: u32) {
        self.handler_attempts_total
            .with_label_values(&[topic, &attempt.to_string()])
            .inc();
    }

    pub fn record_dead_letter(&self, topic: &str, reason: &str) {
        self.dead_letters_total.with_label_values(&[topic, reason]).inc();
    }

    pub fn record_publish(&self, topic: &str, outcome: Result<(), &str>) {
        match outcome {
            Ok(()) => self.events_published.with_label_values(&[topic]).inc(),
            Err(reason) => self.publish_failures.with_label_values(&[topic, reason]).inc(),
        }
    }

    pub fn record_event_lost(&self, event_type: &str) {
        self.events_lost_after_commit.with_label_values(&[event_type]).inc();
    }

    pub fn record_unit_of_work(&self, outcome: &str) {
        self.units_of_work.with_label_values(&[outcome]).inc();
    }

    pub fn record_invalidated(&self, keys: usize) {
        self.cache_keys_invalidated.inc_by(keys as u64);
    }

    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str, gauge: i64) {
        self.circuit_breaker_transitions
            .with_label_values(&[from_state, to_state])
            .inc();
        self.circuit_breaker_state.set(gauge);
    }
}
