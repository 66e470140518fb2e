//! Shared fixtures for this crate's unit tests.

use bazaar_core::{FixedClock, LogEventPublisher};
use bazaar_shared::{EventId, OrderId, OrderStatus};
use bazaar_wallet::{
    InMemoryLedger, LedgerRepository, PayoutFrequency, PayoutSchedule, WalletLedger, WeeklyWindow,
};
use chrono::{DateTime, Utc, Weekday};
use std::sync::Arc;

use crate::fulfillment::FulfillmentEngine;
use crate::manager::OrderStore;
use crate::memory::InMemoryOrders;
use crate::models::{FulfillmentSeed, LineItem, LineItemKind, OrderAmount, OrderHeader, ShippingMethod};
use crate::orchestrator::{CheckoutOrchestrator, ConfirmedPayment};
use crate::timeline::{InMemoryTimeline, Timeline};

pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-05T04:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn header(items_subtotal: i64, fees: i64, total: i64) -> OrderHeader {
    OrderHeader {
        id: OrderId::new(),
        buyer_id: "buyer-1".into(),
        event_id: Some(EventId::new("evt-1")),
        currency: "PHP".parse().unwrap(),
        status: OrderStatus::Paid,
        amount: OrderAmount {
            items_subtotal_minor: items_subtotal,
            fees_minor: fees,
            total_minor: total,
        },
        deliver_to: None,
        provider: "mockpay".into(),
        provider_ref: Some("pi_123".into()),
        created_at: now(),
    }
}

/// Merch from vendor X (2 x 1000) and a ticket from vendor Y (1 x 5000).
pub fn scenario_items() -> Vec<LineItem> {
    vec![
        LineItem {
            line_key: "merch-1".into(),
            vendor_id: "vendor-x".into(),
            name: "Tour shirt".into(),
            qty: 2,
            unit_price_minor: 1000,
            subtotal_minor: 2000,
            kind: LineItemKind::Merch {
                merch_item_id: "shirt-01".into(),
                variant: Some("L".into()),
            },
        },
        LineItem {
            line_key: "ticket-1".into(),
            vendor_id: "vendor-y".into(),
            name: "General admission".into(),
            qty: 1,
            unit_price_minor: 5000,
            subtotal_minor: 5000,
            kind: LineItemKind::Ticket {
                ticket_type_id: "ga".into(),
            },
        },
    ]
}

/// Merch ships for 500; the ticket is digital.
pub fn scenario_seeds() -> Vec<FulfillmentSeed> {
    vec![
        FulfillmentSeed {
            line_key: "merch-1".into(),
            vendor_id: "vendor-x".into(),
            qty_ordered: 2,
            method: ShippingMethod::Delivery {
                address: "12 Mabini St, Manila".into(),
            },
            fee_minor: 500,
        },
        FulfillmentSeed {
            line_key: "ticket-1".into(),
            vendor_id: "vendor-y".into(),
            qty_ordered: 1,
            method: ShippingMethod::Digital,
            fee_minor: 0,
        },
    ]
}

pub fn stores() -> (Arc<OrderStore>, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(now()));
    let store = Arc::new(OrderStore::new(Arc::new(InMemoryOrders::new()), clock.clone()));
    (store, clock)
}

pub struct Fixture {
    pub order_id: OrderId,
    pub clock: Arc<FixedClock>,
    pub store: Arc<OrderStore>,
    pub timeline: Arc<Timeline>,
    pub ledger: Arc<WalletLedger>,
    pub engine: FulfillmentEngine,
    pub orchestrator: CheckoutOrchestrator,
}

pub fn schedule() -> PayoutSchedule {
    PayoutSchedule::new(
        PayoutFrequency::Weekly,
        WeeklyWindow::new(Weekday::Sun, 23).unwrap(),
        WeeklyWindow::new(Weekday::Wed, 10).unwrap(),
        "Asia/Manila",
    )
    .unwrap()
}

/// The two-vendor scenario checkout.
pub fn payment() -> ConfirmedPayment {
    ConfirmedPayment {
        header: header(7000, 0, 7500),
        line_items: scenario_items(),
        shipping: scenario_seeds(),
        vendor_credits: Vec::new(),
    }
}

/// Orchestrator over in-memory orders and timeline and the given ledger.
pub fn orchestrator_over(
    ledger_repo: Arc<dyn LedgerRepository>,
) -> (CheckoutOrchestrator, Arc<OrderStore>, Arc<WalletLedger>, Arc<Timeline>) {
    let (store, clock) = stores();
    let timeline = Arc::new(Timeline::new(Arc::new(InMemoryTimeline::new()), clock.clone()));
    let ledger = Arc::new(WalletLedger::new(ledger_repo, clock.clone(), schedule()));
    let orchestrator = CheckoutOrchestrator::new(
        store.clone(),
        ledger.clone(),
        timeline.clone(),
        Arc::new(LogEventPublisher),
        clock,
    );
    (orchestrator, store, ledger, timeline)
}

/// Services wired over in-memory storage with the two-vendor order confirmed.
pub async fn fixture() -> Fixture {
    let (store, clock) = stores();
    let timeline = Arc::new(Timeline::new(Arc::new(InMemoryTimeline::new()), clock.clone()));
    let ledger = Arc::new(WalletLedger::new(Arc::new(InMemoryLedger::new()), clock.clone(), schedule()));
    let publisher = Arc::new(LogEventPublisher);

    let engine = FulfillmentEngine::new(
        store.repository().clone(),
        timeline.clone(),
        publisher.clone(),
        clock.clone(),
    );
    let orchestrator = CheckoutOrchestrator::new(
        store.clone(),
        ledger.clone(),
        timeline.clone(),
        publisher,
        clock.clone(),
    );

    let confirmed = orchestrator.confirm_payment(payment()).await.unwrap();

    Fixture {
        order_id: confirmed.order.id(),
        clock,
        store,
        timeline,
        ledger,
        engine,
        orchestrator,
    }
}
