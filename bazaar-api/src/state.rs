use bazaar_core::payout_rail::PayoutRail;
use bazaar_core::{Clock, EventPublisher};
use bazaar_order::{
    CheckoutOrchestrator, FulfillmentEngine, InMemoryOrders, InMemoryTimeline, OrderRepository, OrderStore, Timeline,
    TimelineRepository,
};
use bazaar_store::app_config::RateLimitConfig;
use bazaar_store::{DbClient, PgLedgerRepository, PgOrderRepository, PgTimelineRepository, RedisClient};
use bazaar_wallet::{InMemoryLedger, LedgerRepository, PayoutSchedule, PayoutScheduler, PayoutService, WalletLedger};
use std::sync::Arc;

use crate::metrics::ApiMetrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

/// The three storage seams, all in memory or all in Postgres.
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrderRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub timeline: Arc<dyn TimelineRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            orders: Arc::new(InMemoryOrders::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            timeline: Arc::new(InMemoryTimeline::new()),
        }
    }

    pub fn postgres(db: &DbClient) -> Self {
        Self {
            orders: Arc::new(PgOrderRepository::new(db.pool.clone())),
            ledger: Arc::new(PgLedgerRepository::new(db.pool.clone())),
            timeline: Arc::new(PgTimelineRepository::new(db.pool.clone())),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderStore>,
    pub fulfillment: Arc<FulfillmentEngine>,
    pub checkout: Arc<CheckoutOrchestrator>,
    pub timeline: Arc<Timeline>,
    pub ledger: Arc<WalletLedger>,
    pub payouts: Arc<PayoutService>,
    pub sweeper: Arc<PayoutScheduler>,
    pub clock: Arc<dyn Clock>,
    pub redis: Option<Arc<RedisClient>>,
    pub rate_limit: RateLimitConfig,
    pub metrics: Arc<ApiMetrics>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(
        repos: Repositories,
        publisher: Arc<dyn EventPublisher>,
        rail: Arc<dyn PayoutRail>,
        clock: Arc<dyn Clock>,
        default_schedule: PayoutSchedule,
        auth: AuthConfig,
    ) -> Result<Self, prometheus::Error> {
        let orders = Arc::new(OrderStore::new(repos.orders.clone(), clock.clone()));
        let timeline = Arc::new(Timeline::new(repos.timeline, clock.clone()));
        let ledger = Arc::new(WalletLedger::new(repos.ledger, clock.clone(), default_schedule));

        let fulfillment = Arc::new(FulfillmentEngine::new(
            repos.orders,
            timeline.clone(),
            publisher.clone(),
            clock.clone(),
        ));
        let checkout = Arc::new(CheckoutOrchestrator::new(
            orders.clone(),
            ledger.clone(),
            timeline.clone(),
            publisher.clone(),
            clock.clone(),
        ));
        let payouts = Arc::new(PayoutService::new(ledger.clone(), rail, publisher.clone()));
        let sweeper = Arc::new(PayoutScheduler::new(ledger.clone(), publisher));

        Ok(Self {
            orders,
            fulfillment,
            checkout,
            timeline,
            ledger,
            payouts,
            sweeper,
            clock,
            redis: None,
            rate_limit: RateLimitConfig::default(),
            metrics: Arc::new(ApiMetrics::new()?),
            auth,
        })
    }

    pub fn with_redis(mut self, redis: Arc<RedisClient>, rate_limit: RateLimitConfig) -> Self {
        self.redis = Some(redis);
        self.rate_limit = rate_limit;
        self
    }
}
