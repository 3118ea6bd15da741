use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Span;

use super::commands::{CommandEnvelope, ProductCommand};
use super::events::{
    ChangeEvent, PRODUCT_COMMANDS_TOPIC, PRODUCT_CREATED, PRODUCT_DELETED, PRODUCT_EVENTS_TOPIC,
    PRODUCT_INVENTORY_UPDATED, PRODUCT_PRICE_UPDATED, PRODUCT_UPDATED,
};
use super::service::ProductService;
use crate::cache::CacheInvalidator;
use crate::context::RequestContext;
use crate::error::Result;
use crate::messaging::{
    CommitMode, Event, MessageHandler, Subscription, SubscriptionManager, SubscriptionOptions,
};

// ============================================================================
// Catalog Worker
// ============================================================================
//
// Two subscriptions:
//
// - product-commands, group product-service-commands, manual commit. A
//   command is only acknowledged after the service call returns.
// - product-events, group product-service-events, auto commit every 5s.
//   Change events drop the tenant's cached product and list entries.
//
// Undecodable payloads fail with PermanentDecode and go straight to the
// dead-letter topic. Unknown command and event types are logged and acked.
//
// ============================================================================

pub const COMMANDS_GROUP: &str = "product-service-commands";
pub const EVENTS_GROUP: &str = "product-service-events";
pub const EVENTS_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Tenant from the envelope wins; headers are the fallback.
fn scoped(ctx: &RequestContext, tenant_id: &str) -> RequestContext {
    let mut scoped = ctx.clone();
    if !tenant_id.is_empty() {
        scoped.tenant_id = Some(tenant_id.to_string());
    }
    scoped
}

pub struct ProductCommandHandler {
    service: ProductService,
    span: Span,
}

impl ProductCommandHandler {
    pub fn new(service: ProductService, span: Span) -> Self {
        Self { service, span }
    }
}

#[async_trait]
impl MessageHandler for ProductCommandHandler {
    async fn handle(&self, ctx: &RequestContext, event: &Event) -> Result<()> {
        let started = Instant::now();
        let envelope: CommandEnvelope = event.decode()?;
        let ctx = scoped(ctx, &envelope.tenant_id);

        let Some(command) = ProductCommand::parse(&envelope)? else {
            tracing::warn!(
                parent: &self.span,
                command_type = %envelope.command_type,
                message_id = %event.id,
                "Ignoring unknown command type"
            );
            return Ok(());
        };

        match command {
            ProductCommand::SyncProductsFromSupplier { supplier_id } => {
                self.service.sync_products_from_supplier(&ctx, supplier_id).await?;
            }
            ProductCommand::SyncProductToMarketplace {
                product_id,
                marketplace_id,
            } => {
                self.service
                    .sync_product_to_marketplace(&ctx, &product_id, marketplace_id)
                    .await?;
            }
        }

        tracing::info!(
            parent: &self.span,
            command_type = %envelope.command_type,
            message_id = %event.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "✅ Command processed"
        );
        Ok(())
    }
}

pub struct ProductEventHandler {
    invalidator: CacheInvalidator,
    span: Span,
}

impl ProductEventHandler {
    pub fn new(invalidator: CacheInvalidator, span: Span) -> Self {
        Self { invalidator, span }
    }
}

#[async_trait]
impl MessageHandler for ProductEventHandler {
    async fn handle(&self, ctx: &RequestContext, event: &Event) -> Result<()> {
        let change: ChangeEvent = event.decode()?;
        let ctx = scoped(ctx, &change.tenant_id);

        match change.event_type.as_str() {
            PRODUCT_CREATED | PRODUCT_UPDATED | PRODUCT_DELETED | PRODUCT_PRICE_UPDATED
            | PRODUCT_INVENTORY_UPDATED => {}
            other => {
                tracing::warn!(
                    parent: &self.span,
                    event_type = other,
                    message_id = %event.id,
                    "Ignoring unknown event type"
                );
                return Ok(());
            }
        }

        match (ctx.tenant(), change.product_id()) {
            ("", _) | (_, None) => {
                tracing::debug!(
                    parent: &self.span,
                    event_type = %change.event_type,
                    message_id = %event.id,
                    "Change event without tenant or product id, nothing to invalidate"
                );
            }
            (tenant, Some(product_id)) => {
                let removed = self.invalidator.on_product_changed(tenant, product_id).await?;
                tracing::debug!(
                    parent: &self.span,
                    event_type = %change.event_type,
                    product_id = product_id,
                    removed = removed,
                    "Cache invalidated from change event"
                );
            }
        }
        Ok(())
    }
}

/// Subscribe the command and event handlers. Both subscriptions are
/// returned so the caller can unsubscribe them individually.
pub async fn start_worker(
    manager: &SubscriptionManager,
    service: ProductService,
    span: Span,
) -> Result<Vec<Subscription>> {
    let invalidator = service.invalidator().clone();

    let commands = manager
        .subscribe_with(
            PRODUCT_COMMANDS_TOPIC,
            Arc::new(ProductCommandHandler::new(service, span.clone())),
            SubscriptionOptions::default()
                .group(COMMANDS_GROUP)
                .commit(CommitMode::Manual),
        )
        .await?;

    let events = manager
        .subscribe_with(
            PRODUCT_EVENTS_TOPIC,
            Arc::new(ProductEventHandler::new(invalidator, span.clone())),
            SubscriptionOptions::default()
                .group(EVENTS_GROUP)
                .commit(CommitMode::Auto {
                    interval: EVENTS_COMMIT_INTERVAL,
                }),
        )
        .await?;

    tracing::info!(parent: &span, "🚀 Catalog worker subscribed to commands and events");
    Ok(vec![commands, events])
}
