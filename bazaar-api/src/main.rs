use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bazaar_api::{
    app,
    state::{AppState, AuthConfig, Repositories},
    worker,
};
use bazaar_core::payout_rail::MockPayoutRail;
use bazaar_core::{EventPublisher, LogEventPublisher, SystemClock};
use bazaar_store::app_config::{Config, StorageBackend};
use bazaar_store::{DbClient, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bazaar_api=debug,bazaar_order=debug,bazaar_wallet=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("failed to load config")?;
    let default_schedule = config.payouts.schedule().context("invalid payout schedule")?;
    tracing::info!("Starting Bazaar API on port {}", config.server.port);

    let repos = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on restart");
            Repositories::in_memory()
        }
        StorageBackend::Postgres => {
            let db = DbClient::new(&config.database)
                .await
                .context("failed to connect to Postgres")?;
            db.migrate().await.context("failed to run migrations")?;
            Repositories::postgres(&db)
        }
    };

    let publisher = event_publisher(&config)?;

    let mut state = AppState::new(
        repos,
        publisher,
        Arc::new(MockPayoutRail::new()),
        Arc::new(SystemClock),
        default_schedule,
        AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
    )
    .context("failed to register metrics")?;

    if let Some(url) = &config.redis.url {
        let redis = RedisClient::new(url).await.context("failed to connect to Redis")?;
        state = state.with_redis(Arc::new(redis), config.rate_limit.clone());
    }

    let sweep_every = Duration::from_secs(config.payouts.sweep_interval_seconds.max(1));
    tokio::spawn(worker::start_payout_worker(state.clone(), sweep_every));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

#[cfg(feature = "kafka")]
fn event_publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match &config.kafka.brokers {
        Some(brokers) => {
            let producer = bazaar_store::KafkaEventPublisher::new(brokers, "bazaar")
                .context("failed to create Kafka producer")?;
            Ok(Arc::new(producer))
        }
        None => Ok(Arc::new(LogEventPublisher)),
    }
}

#[cfg(not(feature = "kafka"))]
fn event_publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    if config.kafka.brokers.is_some() {
        tracing::warn!("Kafka brokers configured but the kafka feature is off; logging events instead");
    }
    Ok(Arc::new(LogEventPublisher))
}
