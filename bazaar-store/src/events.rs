use async_trait::async_trait;
use bazaar_core::{CoreError, EventPublisher};
use bazaar_shared::models::events::DomainEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// In-process fan-out of domain events. Used when no broker is configured and
/// by tests that want to observe what was published.
#[derive(Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), CoreError> {
        // No subscribers is not an error.
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        debug!(event = event.name(), key = %event.key(), receivers, "event broadcast");
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaEventPublisher;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;
    use std::time::Duration;
    use tracing::{error, info};

    /// Publishes each event to `{prefix}.{event name}`, keyed by order or vendor.
    #[derive(Clone)]
    pub struct KafkaEventPublisher {
        producer: FutureProducer,
        topic_prefix: String,
    }

    impl KafkaEventPublisher {
        pub fn new(brokers: &str, topic_prefix: &str) -> Result<Self, rdkafka::error::KafkaError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()?;

            Ok(Self {
                producer,
                topic_prefix: topic_prefix.to_string(),
            })
        }
    }

    #[async_trait]
    impl EventPublisher for KafkaEventPublisher {
        async fn publish(&self, event: &DomainEvent) -> Result<(), CoreError> {
            let topic = format!("{}.{}", self.topic_prefix, event.name());
            let key = event.key();
            let payload = serde_json::to_string(event).map_err(CoreError::storage)?;

            let record = FutureRecord::to(&topic).key(&key).payload(&payload);

            match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
                Ok(delivery) => {
                    info!(
                        "Sent message to {}/{}: partition {} offset {}",
                        topic, key, delivery.partition, delivery.offset
                    );
                    Ok(())
                }
                Err((e, _msg)) => {
                    error!("Failed to send message to {}: {}", topic, e);
                    Err(CoreError::storage(e))
                }
            }
        }
    }
}
