use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_events::cache::{CacheInvalidator, CacheStore, MemoryCache, RedisCache, TenantCache};
use catalog_events::catalog::{start_worker, ProductService};
use catalog_events::config::{Backend, Config};
use catalog_events::messaging::{
    Broker, EventPublisher, KafkaBroker, KafkaSettings, MemoryBroker, SubscriptionManager,
};
use catalog_events::metrics::{self, HealthProbe, Metrics};
use catalog_events::storage::{MemoryStore, PostgresStore, TransactionalStore, UnitOfWorkCoordinator};
use catalog_events::utils::{
    retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig,
};

fn init_tracing() {
    // Default to INFO, overridable with RUST_LOG. LOG_FORMAT=json for log shippers.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,catalog_events=debug"));

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

struct Backends {
    store: Arc<dyn TransactionalStore>,
    broker: Arc<dyn Broker>,
    cache: Arc<dyn CacheStore>,
}

async fn connect_backends(config: &Config) -> anyhow::Result<Backends> {
    match config.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory store, broker and cache; nothing is persisted");
            Ok(Backends {
                store: Arc::new(MemoryStore::new()),
                broker: Arc::new(MemoryBroker::new()),
                cache: Arc::new(MemoryCache::new()),
            })
        }
        Backend::External => {
            let startup = RetryConfig::startup();

            tracing::info!("Connecting to PostgreSQL...");
            let store = retry_with_backoff(&startup, |_| {
                PostgresStore::connect(&config.database_url, config.db_pool_size)
            })
            .await
            .into_result()?;
            store.ensure_schema().await?;

            tracing::info!(brokers = %config.kafka_brokers, "Connecting to Kafka...");
            let broker = KafkaBroker::connect(KafkaSettings::new(config.kafka_brokers.clone()))?;

            tracing::info!("Connecting to Redis...");
            let cache = retry_with_backoff(&startup, |_| RedisCache::connect(&config.redis_url))
                .await
                .into_result()?;

            Ok(Backends {
                store: Arc::new(store),
                broker: Arc::new(broker),
                cache: Arc::new(cache),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("🚀 Starting catalog worker");

    let config = Config::from_env()?;
    tracing::info!(backend = ?config.backend, group_id = %config.kafka_group_id, "Configuration loaded");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 2. Backends ===
    let backends = connect_backends(&config).await?;

    // === 3. Core components ===
    let breaker_metrics = metrics.clone();
    let breaker = CircuitBreaker::new("kafka-producer", CircuitBreakerConfig::default()).with_observer(
        Arc::new(move |from: CircuitState, to: CircuitState| {
            breaker_metrics.record_circuit_breaker_transition(from.as_str(), to.as_str(), to.as_gauge());
        }),
    );
    let publisher = EventPublisher::new(
        backends.broker.clone(),
        breaker.clone(),
        tracing::info_span!("publisher"),
    )
    .with_metrics(metrics.clone());

    let uow = UnitOfWorkCoordinator::new(backends.store.clone(), tracing::info_span!("unit_of_work"))
        .with_metrics(metrics.clone());
    let invalidator = CacheInvalidator::new(backends.cache.clone(), tracing::info_span!("cache"))
        .with_metrics(metrics.clone());
    let service = ProductService::new(
        Arc::new(uow),
        publisher.clone(),
        TenantCache::new(backends.cache.clone()),
        invalidator,
        tracing::info_span!("product_service"),
    )
    .with_metrics(metrics.clone());

    let manager = SubscriptionManager::new(
        backends.broker.clone(),
        publisher,
        config.consumer_settings(),
        tracing::info_span!("subscriptions"),
    )
    .with_metrics(metrics.clone());

    // === 4. Metrics server ===
    let registry = Arc::new(metrics.registry().clone());
    let probe = HealthProbe {
        service: "catalog-worker".to_string(),
        producer_breaker: breaker,
        active_subscriptions: metrics.active_subscriptions.clone(),
    };
    let metrics_port = config.metrics_port;
    // actix-web runs on its own runtime in a dedicated thread
    std::thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(registry, probe, metrics_port).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        }),
        Err(e) => tracing::error!(error = %e, "Failed to start metrics runtime"),
    });

    // === 5. Subscriptions ===
    let subscriptions = start_worker(&manager, service, tracing::info_span!("worker")).await?;
    tracing::info!(count = subscriptions.len(), "✅ Worker running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown signal received");

    // === 6. Graceful shutdown ===
    if let Err(e) = manager.close().await {
        tracing::warn!(error = %e, "Subscription manager closed with errors");
    }
    backends.cache.close().await;
    backends.store.close().await;

    tracing::info!("👋 Catalog worker stopped");
    Ok(())
}
