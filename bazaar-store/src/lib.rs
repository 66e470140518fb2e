pub mod app_config;
pub mod database;
pub mod events;
pub mod ledger_repo;
pub mod order_repo;
pub mod redis_repo;
pub mod timeline_repo;

pub use app_config::{Config, StorageBackend};
pub use database::DbClient;
pub use events::BroadcastEventPublisher;
#[cfg(feature = "kafka")]
pub use events::KafkaEventPublisher;
pub use ledger_repo::PgLedgerRepository;
pub use order_repo::PgOrderRepository;
pub use redis_repo::RedisClient;
pub use timeline_repo::PgTimelineRepository;
