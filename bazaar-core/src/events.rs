use async_trait::async_trait;
use bazaar_shared::models::events::DomainEvent;
use tracing::info;

use crate::CoreError;

/// Outbound event bus. Publishing is best effort: callers log failures and
/// carry on, the ledger and timeline stay the source of truth.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), CoreError>;
}

/// Writes events to the tracing log; the default when no broker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), CoreError> {
        let payload = serde_json::to_string(event).map_err(CoreError::storage)?;
        info!(event = event.name(), key = %event.key(), %payload, "domain event");
        Ok(())
    }
}
