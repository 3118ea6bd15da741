use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use crate::utils::{CircuitBreaker, CircuitState};

/// Inputs for `/health`: the producer breaker and the live subscription count.
#[derive(Clone)]
pub struct HealthProbe {
    pub service: String,
    pub producer_breaker: CircuitBreaker,
    pub active_subscriptions: IntGauge,
}

/// Start the metrics HTTP server
/// This should be called in a separate thread/runtime to avoid conflicts
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    probe: HealthProbe,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(probe.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(probe: web::Data<HealthProbe>) -> impl Responder {
    let breaker = probe.producer_breaker.state().await;
    let status = match breaker {
        CircuitState::Closed => "healthy",
        CircuitState::HalfOpen | CircuitState::Open => "degraded",
    };

    let body = serde_json::json!({
        "status": status,
        "service": probe.service,
        "producer_circuit": breaker.as_str(),
        "active_subscriptions": probe.active_subscriptions.get(),
    });

    if breaker == CircuitState::Open {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}
