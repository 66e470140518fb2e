use bazaar_core::{Actor, Clock, CoreError, CoreResult, EventPublisher};
use bazaar_shared::models::events::{DomainEvent, OrderCreatedEvent};
use bazaar_shared::{MinorUnits, OrderStatus, VendorId};
use bazaar_wallet::{EarningsSource, LedgerEntryType, SaleHold, WalletLedger, WalletLedgerEntry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::manager::{build_fulfillment_lines, validate_line_items, OrderStore};
use crate::models::{FulfillmentSeed, LineItem, Order, OrderHeader};
use crate::timeline::{NewTimelineEvent, Timeline, TimelineKind};

/// Earnings owed to one vendor from this checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VendorCredit {
    pub vendor_id: VendorId,
    pub source: EarningsSource,
    pub amount_minor: MinorUnits,
    #[serde(default)]
    pub note: Option<String>,
}

/// What the payment collaborator hands over once a checkout is paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedPayment {
    pub header: OrderHeader,
    pub line_items: Vec<LineItem>,
    pub shipping: Vec<FulfillmentSeed>,
    /// When empty, each vendor is credited the subtotal of its lines.
    #[serde(default)]
    pub vendor_credits: Vec<VendorCredit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedOrder {
    pub order: Order,
    pub holds: Vec<WalletLedgerEntry>,
}

/// Turns a confirmed payment into an order, its fulfillment lines and one
/// wallet hold per vendor credit.
pub struct CheckoutOrchestrator {
    store: Arc<OrderStore>,
    ledger: Arc<WalletLedger>,
    timeline: Arc<Timeline>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl CheckoutOrchestrator {
    pub fn new(
        store: Arc<OrderStore>,
        ledger: Arc<WalletLedger>,
        timeline: Arc<Timeline>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            timeline,
            publisher,
            clock,
        }
    }

    /// Validate the whole payload up front, then write order, lines and holds.
    ///
    /// Retrying with the same order id resumes a confirmation that failed
    /// part way: the order is reused when it matches the payload, lines are
    /// seeded only once and only the missing holds are written.
    pub async fn confirm_payment(&self, payment: ConfirmedPayment) -> CoreResult<ConfirmedOrder> {
        let ConfirmedPayment {
            header,
            line_items,
            shipping,
            vendor_credits,
        } = payment;

        if header.status != OrderStatus::Paid {
            return Err(CoreError::Invalid(format!(
                "only paid orders can be confirmed, got {}",
                header.status
            )));
        }
        validate_line_items(&header, &line_items)?;
        let draft = Order::new(header.clone(), line_items.clone());
        build_fulfillment_lines(&draft, &shipping, self.clock.now())?;

        let credits = if vendor_credits.is_empty() {
            credits_from_lines(&line_items)
        } else {
            vendor_credits
        };
        self.validate_credits(&draft, &credits).await?;

        let order = match self.store.repository().get_order(header.id).await? {
            Some(existing) if same_checkout(&existing, &draft) => {
                info!(order_id = %existing.id(), "resuming payment confirmation");
                existing
            }
            Some(existing) => {
                return Err(CoreError::Conflict(format!(
                    "order {} was confirmed with a different payload",
                    existing.id()
                )))
            }
            None => self.store.create_order(header, line_items).await?,
        };
        let order = if order.is_seeded() {
            order
        } else {
            self.store.append_fulfillment_lines(order.id(), shipping).await?
        };

        let mut written: HashMap<VendorId, Vec<WalletLedgerEntry>> = HashMap::new();
        let mut holds = Vec::with_capacity(credits.len());
        for credit in credits {
            if !written.contains_key(&credit.vendor_id) {
                let existing = self
                    .ledger
                    .entries(&credit.vendor_id, None)
                    .await?
                    .into_iter()
                    .filter(|e| {
                        e.entry_type == LedgerEntryType::DebitHold
                            && e.corrects.is_none()
                            && e.order_ref == Some(order.id())
                    })
                    .collect();
                written.insert(credit.vendor_id.clone(), existing);
            }
            let earlier = written.get_mut(&credit.vendor_id).and_then(|existing| {
                let at = existing
                    .iter()
                    .position(|e| e.source == credit.source && e.amount_minor == -credit.amount_minor)?;
                Some(existing.remove(at))
            });
            if let Some(hold) = earlier {
                holds.push(hold);
                continue;
            }

            let hold = self
                .ledger
                .hold_for_sale(
                    SaleHold {
                        vendor_id: credit.vendor_id,
                        currency: order.header.currency.clone(),
                        source: credit.source,
                        order_ref: Some(order.id()),
                        event_id: order.header.event_id.clone(),
                        amount_minor: credit.amount_minor,
                        note: credit.note,
                    },
                    Actor::System,
                )
                .await?;
            holds.push(hold);
        }

        let vendor_ids: Vec<VendorId> = order.vendor_ids().into_iter().collect();
        self.timeline
            .record(NewTimelineEvent {
                order_id: order.id(),
                kind: TimelineKind::OrderCreated,
                actor: Actor::System,
                message: format!("order paid via {}", order.header.provider),
                meta: json!({
                    "vendorIds": vendor_ids,
                    "totalMinor": order.header.amount.total_minor,
                    "providerRef": order.header.provider_ref,
                }),
                idempotency_key: Some(format!("order_created:{}", order.id())),
            })
            .await?;
        for hold in &holds {
            self.timeline
                .record(NewTimelineEvent {
                    order_id: order.id(),
                    kind: TimelineKind::EarningsHeld,
                    actor: Actor::System,
                    message: format!("{} earnings held for {}", hold.vendor_id, hold.target_payout_key.as_deref().unwrap_or("-")),
                    meta: json!({
                        "vendorId": hold.vendor_id,
                        "entryId": hold.id,
                        "amountMinor": -hold.amount_minor,
                        "targetPayoutAt": hold.target_payout_at,
                    }),
                    idempotency_key: Some(format!("earnings_held:{}", hold.id)),
                })
                .await?;
        }

        let event = DomainEvent::OrderCreated(OrderCreatedEvent {
            order_id: order.id(),
            vendor_ids,
            total_minor: order.header.amount.total_minor,
            currency: order.header.currency.to_string(),
            timestamp: self.clock.now().timestamp(),
        });
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(order_id = %order.id(), error = %e, "failed to publish order event");
        }

        info!(order_id = %order.id(), holds = holds.len(), "payment confirmed");
        Ok(ConfirmedOrder { order, holds })
    }

    async fn validate_credits(&self, draft: &Order, credits: &[VendorCredit]) -> CoreResult<()> {
        let vendors = draft.vendor_ids();
        let mut total: MinorUnits = 0;
        for credit in credits {
            if !vendors.contains(&credit.vendor_id) {
                return Err(CoreError::Invalid(format!(
                    "vendor {} has no line in this order",
                    credit.vendor_id
                )));
            }
            if credit.amount_minor <= 0 {
                return Err(CoreError::InvalidAmount(format!(
                    "credit for vendor {} must be positive",
                    credit.vendor_id
                )));
            }
            total = total
                .checked_add(credit.amount_minor)
                .ok_or_else(|| CoreError::InvalidAmount("credits overflow".into()))?;

            if let Some(existing) = self.ledger.wallet_currency(&credit.vendor_id).await? {
                if existing != draft.header.currency {
                    return Err(CoreError::CurrencyMismatch {
                        vendor_id: credit.vendor_id.to_string(),
                        expected: existing.to_string(),
                        found: draft.header.currency.to_string(),
                    });
                }
            }
        }
        if total > draft.header.amount.total_minor {
            return Err(CoreError::InvalidAmount(format!(
                "credits {} exceed the order total {}",
                total, draft.header.amount.total_minor
            )));
        }
        Ok(())
    }
}

/// Whether a stored order came from the same checkout as `draft`.
fn same_checkout(stored: &Order, draft: &Order) -> bool {
    let sorted = |order: &Order| {
        let mut items = order.line_items.clone();
        items.sort_by(|a, b| a.line_key.cmp(&b.line_key));
        items
    };
    stored.header.buyer_id == draft.header.buyer_id
        && stored.header.currency == draft.header.currency
        && stored.header.amount == draft.header.amount
        && sorted(stored) == sorted(draft)
}

/// One credit per (vendor, source) pair, worth the subtotal of its lines.
fn credits_from_lines(items: &[LineItem]) -> Vec<VendorCredit> {
    let mut totals: BTreeMap<(VendorId, EarningsSource), MinorUnits> = BTreeMap::new();
    for item in items {
        *totals
            .entry((item.vendor_id.clone(), item.earnings_source()))
            .or_insert(0) += item.subtotal_minor;
    }
    totals
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|((vendor_id, source), amount_minor)| VendorCredit {
            vendor_id,
            source,
            amount_minor,
            note: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, header, orchestrator_over, payment, scenario_items, scenario_seeds};
    use bazaar_wallet::testing::FailingAppends;
    use bazaar_shared::{LineKey, OrderId};
    use bazaar_wallet::LedgerEntryType;

    #[tokio::test]
    async fn test_confirm_creates_order_lines_and_holds() {
        let f = fixture().await;
        let order = f.store.get_order(f.order_id).await.unwrap();
        assert_eq!(order.fulfillment_lines.len(), 2);

        let x = f.ledger.entries(&VendorId::new("vendor-x"), None).await.unwrap();
        assert_eq!(x.len(), 1);
        assert_eq!(x[0].entry_type, LedgerEntryType::DebitHold);
        assert_eq!(x[0].amount_minor, -2000);
        assert_eq!(x[0].source, EarningsSource::Store);
        assert_eq!(x[0].order_ref, Some(f.order_id));

        let y = f.ledger.balances(&VendorId::new("vendor-y")).await.unwrap();
        assert_eq!(y.on_hold_minor, 5000);

        let kinds: Vec<_> = f
            .timeline
            .events(f.order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds[0], TimelineKind::OrderCreated);
        assert_eq!(kinds.iter().filter(|k| **k == TimelineKind::EarningsHeld).count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_payload_writes_nothing() {
        let f = fixture().await;
        let mut header = header(7000, 0, 7500);
        header.id = OrderId::new();
        let mut seeds = scenario_seeds();
        seeds[0].line_key = LineKey::from("merch-404");

        let err = f
            .orchestrator
            .confirm_payment(ConfirmedPayment {
                header: header.clone(),
                line_items: scenario_items(),
                shipping: seeds,
                vendor_credits: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(matches!(f.store.get_order(header.id).await, Err(CoreError::NotFound(_))));
        assert_eq!(f.ledger.entries(&VendorId::new("vendor-x"), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_currency_mismatch_is_caught_before_writing() {
        let f = fixture().await;
        let mut header = header(7000, 0, 7500);
        header.id = OrderId::new();
        header.currency = "USD".parse().unwrap();

        let err = f
            .orchestrator
            .confirm_payment(ConfirmedPayment {
                header: header.clone(),
                line_items: scenario_items(),
                shipping: scenario_seeds(),
                vendor_credits: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CurrencyMismatch { .. }));
        assert!(f.store.get_order(header.id).await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_credits_are_bounded_by_total() {
        let f = fixture().await;
        let mut header = header(7000, 0, 7500);
        header.id = OrderId::new();

        let err = f
            .orchestrator
            .confirm_payment(ConfirmedPayment {
                header,
                line_items: scenario_items(),
                shipping: scenario_seeds(),
                vendor_credits: vec![VendorCredit {
                    vendor_id: "vendor-x".into(),
                    source: EarningsSource::Store,
                    amount_minor: 9000,
                    note: None,
                }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));
    }

    #[test]
    fn test_default_credits_follow_line_subtotals() {
        let credits = credits_from_lines(&scenario_items());
        assert_eq!(credits.len(), 2);
        let x = credits.iter().find(|c| c.vendor_id.as_str() == "vendor-x").unwrap();
        assert_eq!((x.source, x.amount_minor), (EarningsSource::Store, 2000));
    }

    #[tokio::test]
    async fn test_retry_resumes_after_a_failed_hold() {
        let repo = Arc::new(FailingAppends::new(1, |entries| {
            entries.iter().any(|e| e.vendor_id.as_str() == "vendor-y")
        }));
        let (orchestrator, store, ledger, timeline) = orchestrator_over(repo.clone());
        let payment = payment();
        let order_id = payment.header.id;

        // Order, lines and the first hold land; the second hold does not.
        let err = orchestrator.confirm_payment(payment.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(store.get_order(order_id).await.unwrap().is_seeded());
        assert_eq!(ledger.entries(&VendorId::new("vendor-x"), None).await.unwrap().len(), 1);
        assert!(ledger.entries(&VendorId::new("vendor-y"), None).await.unwrap().is_empty());

        let confirmed = orchestrator.confirm_payment(payment.clone()).await.unwrap();
        assert_eq!(confirmed.order.fulfillment_lines.len(), 2);
        assert_eq!(confirmed.holds.len(), 2);
        for vendor in ["vendor-x", "vendor-y"] {
            let entries = ledger.entries(&VendorId::new(vendor), None).await.unwrap();
            assert_eq!(entries.len(), 1, "{vendor}");
            assert_eq!(entries[0].order_ref, Some(order_id));
        }

        // A further retry changes nothing.
        orchestrator.confirm_payment(payment).await.unwrap();
        assert_eq!(ledger.entries(&VendorId::new("vendor-x"), None).await.unwrap().len(), 1);
        let events = timeline.events(order_id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == TimelineKind::OrderCreated).count(), 1);
        assert_eq!(events.iter().filter(|e| e.kind == TimelineKind::EarningsHeld).count(), 2);
    }

    #[tokio::test]
    async fn test_retry_with_a_different_payload_conflicts() {
        let f = fixture().await;
        let mut changed = payment();
        changed.header.id = f.order_id;
        changed.header.amount.total_minor = 8000;
        changed.header.amount.fees_minor = 500;

        let err = f.orchestrator.confirm_payment(changed).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(f.ledger.entries(&VendorId::new("vendor-x"), None).await.unwrap().len(), 1);
    }
}
