use bazaar_core::{Actor, Clock, CoreError, CoreResult, EventPublisher};
use bazaar_shared::models::events::{DomainEvent, FulfillmentMarkedEvent};
use bazaar_shared::{FulfillmentStatus, LineKey, OrderId, VendorId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::models::{FulfillmentLine, LineNote};
use crate::repository::OrderRepository;
use crate::timeline::{NewTimelineEvent, Timeline, TimelineKind};

/// Whether a line may move from `from` to `to`.
///
/// `unfulfilled -> shipped -> delivered`, `unfulfilled|shipped -> cancelled`,
/// `unfulfilled|shipped|delivered -> fulfilled`. Terminal states accept
/// nothing, not even themselves; other states accept themselves.
pub fn can_transition(from: FulfillmentStatus, to: FulfillmentStatus) -> bool {
    use FulfillmentStatus::*;
    match (from, to) {
        (Fulfilled | Cancelled, _) => false,
        (a, b) if a == b => true,
        (Unfulfilled, Shipped) | (Shipped, Delivered) => true,
        (Unfulfilled | Shipped, Cancelled) => true,
        (Unfulfilled | Shipped | Delivered, Fulfilled) => true,
        _ => false,
    }
}

pub fn is_terminal(status: FulfillmentStatus) -> bool {
    matches!(status, FulfillmentStatus::Fulfilled | FulfillmentStatus::Cancelled)
}

/// A vendor's request to move one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetFulfillmentStatus {
    pub order_id: OrderId,
    pub line_key: LineKey,
    pub requested_by: VendorId,
    pub status: FulfillmentStatus,
    #[serde(default)]
    pub qty_fulfilled: Option<i64>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    /// Version the caller last saw (HTTP `If-Match`).
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub struct FulfillmentEngine {
    orders: Arc<dyn OrderRepository>,
    timeline: Arc<Timeline>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl FulfillmentEngine {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        timeline: Arc<Timeline>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            timeline,
            publisher,
            clock,
        }
    }

    /// Transition: move one fulfillment line on behalf of its vendor.
    ///
    /// Nothing is written unless every check passes. Only the addressed line
    /// and its status projection change.
    pub async fn set_fulfillment_status(&self, req: SetFulfillmentStatus) -> CoreResult<FulfillmentLine> {
        let line = self
            .orders
            .get_line(req.order_id, &req.line_key)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("line {} on order {}", req.line_key, req.order_id))
            })?;

        if line.vendor_id != req.requested_by {
            warn!(
                order_id = %req.order_id,
                line_key = %req.line_key,
                requested_by = %req.requested_by,
                "vendor tried to update a line it does not own"
            );
            return Err(CoreError::NotOwner {
                line_key: req.line_key.to_string(),
                requested_by: req.requested_by.to_string(),
            });
        }

        let qty_fulfilled = match req.qty_fulfilled {
            Some(qty) if qty < 0 || qty > i64::from(line.qty_ordered) => {
                return Err(CoreError::InvalidQuantity {
                    line_key: req.line_key.to_string(),
                    requested: qty,
                    max: line.qty_ordered,
                });
            }
            Some(qty) => u32::try_from(qty).map_err(|_| CoreError::InvalidQuantity {
                line_key: req.line_key.to_string(),
                requested: qty,
                max: line.qty_ordered,
            })?,
            None if req.status == FulfillmentStatus::Fulfilled => line.qty_ordered,
            None => line.qty_fulfilled,
        };

        // A caller holding a stale etag must re-read before we judge the move.
        let expected_version = req.expected_version.unwrap_or(line.version);
        if expected_version != line.version {
            warn!(
                order_id = %req.order_id,
                line_key = %req.line_key,
                expected_version,
                current = line.version,
                "stale fulfillment update"
            );
            return Err(CoreError::Conflict(format!(
                "line {} is at version {}, expected {}",
                req.line_key, line.version, expected_version
            )));
        }

        let from = line.status();
        if !can_transition(from, req.status) {
            warn!(
                order_id = %req.order_id,
                line_key = %req.line_key,
                %from,
                to = %req.status,
                "rejected fulfillment transition"
            );
            return Err(CoreError::TerminalStateViolation {
                line_key: req.line_key.to_string(),
                from: from.to_string(),
                to: req.status.to_string(),
            });
        }

        let now = self.clock.now();
        let mut updated = line.clone();
        updated.shipping.status = req.status;
        updated.qty_fulfilled = qty_fulfilled;
        if req.tracking_number.is_some() {
            updated.shipping.tracking_number = req.tracking_number.clone();
        }
        if req.carrier.is_some() {
            updated.shipping.carrier = req.carrier.clone();
        }
        if let Some(body) = req.note.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            updated.notes.push(LineNote {
                author: Actor::Vendor(req.requested_by.clone()),
                at: now,
                body: body.to_string(),
            });
        }
        updated.version = line.version + 1;
        updated.updated_at = now;

        let vendor_status = updated.vendor_status();
        let saved = self
            .orders
            .update_line(req.order_id, &req.line_key, expected_version, updated, vendor_status)
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    warn!(order_id = %req.order_id, line_key = %req.line_key, "lost update race");
                }
                e
            })?;

        info!(
            order_id = %req.order_id,
            line_key = %req.line_key,
            vendor_id = %req.requested_by,
            %from,
            to = %saved.status(),
            version = saved.version,
            "fulfillment status updated"
        );

        // The line is committed; a timeline failure is logged, not returned.
        let recorded = self
            .timeline
            .record(NewTimelineEvent {
                order_id: req.order_id,
                kind: TimelineKind::FulfillmentMarked,
                actor: Actor::Vendor(req.requested_by.clone()),
                message: format!("{} marked {} as {}", req.requested_by, req.line_key, saved.status()),
                meta: json!({
                    "lineKey": req.line_key,
                    "status": saved.status(),
                    "qtyFulfilled": saved.qty_fulfilled,
                    "trackingNumber": saved.shipping.tracking_number,
                    "carrier": saved.shipping.carrier,
                }),
                idempotency_key: req.idempotency_key.clone(),
            })
            .await;
        if let Err(e) = recorded {
            error!(
                order_id = %req.order_id,
                line_key = %req.line_key,
                status = %saved.status(),
                version = saved.version,
                error = %e,
                "failed to record fulfillment timeline event"
            );
        }

        let event = DomainEvent::FulfillmentMarked(FulfillmentMarkedEvent {
            order_id: req.order_id,
            line_key: req.line_key.clone(),
            vendor_id: req.requested_by.clone(),
            status: saved.status(),
            qty_fulfilled: saved.qty_fulfilled,
            version: saved.version,
            timestamp: now.timestamp(),
        });
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(order_id = %req.order_id, error = %e, "failed to publish fulfillment event");
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Fixture};
    use crate::timeline::{InMemoryTimeline, Note, TimelineEvent, TimelineRepository};
    use bazaar_shared::VendorLineStatus;
    use proptest::prelude::*;

    fn request(f: &Fixture, line: &str, vendor: &str, status: FulfillmentStatus) -> SetFulfillmentStatus {
        SetFulfillmentStatus {
            order_id: f.order_id,
            line_key: line.into(),
            requested_by: vendor.into(),
            status,
            qty_fulfilled: None,
            tracking_number: None,
            carrier: None,
            note: None,
            expected_version: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use FulfillmentStatus::*;
        assert!(can_transition(Unfulfilled, Shipped));
        assert!(can_transition(Shipped, Delivered));
        assert!(can_transition(Delivered, Fulfilled));
        assert!(can_transition(Shipped, Shipped));
        assert!(!can_transition(Unfulfilled, Delivered));
        assert!(!can_transition(Delivered, Shipped));
        assert!(!can_transition(Delivered, Cancelled));
        assert!(!can_transition(Cancelled, Cancelled));
        assert!(!can_transition(Fulfilled, Fulfilled));
    }

    #[tokio::test]
    async fn test_vendor_ships_own_line_only() {
        let f = fixture().await;
        let mut req = request(&f, "merch-1", "vendor-x", FulfillmentStatus::Shipped);
        req.qty_fulfilled = Some(2);
        req.tracking_number = Some("LBC-778".into());

        let line = f.engine.set_fulfillment_status(req).await.unwrap();
        assert_eq!(line.status(), FulfillmentStatus::Shipped);
        assert_eq!(line.qty_fulfilled, 2);
        assert_eq!(line.version, 1);

        let order = f.store.get_order(f.order_id).await.unwrap();
        assert_eq!(order.fulfillment_lines[&LineKey::from("ticket-1")].status(), FulfillmentStatus::Unfulfilled);
        assert_eq!(order.vendor_line_statuses[&LineKey::from("merch-1")], VendorLineStatus::Shipped);
        assert_eq!(order.vendor_line_statuses[&LineKey::from("ticket-1")], VendorLineStatus::Paid);

        let events = f.timeline.events(f.order_id).await.unwrap();
        let marked: Vec<_> = events.iter().filter(|e| e.kind == TimelineKind::FulfillmentMarked).collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].meta["lineKey"], "merch-1");
        assert_eq!(marked[0].meta["trackingNumber"], "LBC-778");
        assert_eq!(marked[0].actor, Actor::Vendor("vendor-x".into()));
    }

    #[tokio::test]
    async fn test_other_vendor_is_not_owner() {
        let f = fixture().await;
        let before = f.store.get_order(f.order_id).await.unwrap();
        let events_before = f.timeline.events(f.order_id).await.unwrap().len();

        let err = f
            .engine
            .set_fulfillment_status(request(&f, "merch-1", "vendor-y", FulfillmentStatus::Shipped))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotOwner { .. }));
        assert!(err.to_string().contains("belongs to another vendor"));

        assert_eq!(f.store.get_order(f.order_id).await.unwrap(), before);
        assert_eq!(f.timeline.events(f.order_id).await.unwrap().len(), events_before);
    }

    #[tokio::test]
    async fn test_cancelled_line_stays_cancelled() {
        let f = fixture().await;
        f.engine
            .set_fulfillment_status(request(&f, "merch-1", "vendor-x", FulfillmentStatus::Cancelled))
            .await
            .unwrap();

        for status in [FulfillmentStatus::Shipped, FulfillmentStatus::Cancelled] {
            let err = f
                .engine
                .set_fulfillment_status(request(&f, "merch-1", "vendor-x", status))
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::TerminalStateViolation { .. }));
            assert!(!err.is_retryable());
        }
        let order = f.store.get_order(f.order_id).await.unwrap();
        assert_eq!(order.fulfillment_lines[&LineKey::from("merch-1")].status(), FulfillmentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_quantity_bounds() {
        let f = fixture().await;
        for qty in [-1, 3] {
            let mut req = request(&f, "merch-1", "vendor-x", FulfillmentStatus::Shipped);
            req.qty_fulfilled = Some(qty);
            let err = f.engine.set_fulfillment_status(req).await.unwrap_err();
            assert!(matches!(err, CoreError::InvalidQuantity { max: 2, .. }));
        }

        let line = f
            .engine
            .set_fulfillment_status(request(&f, "ticket-1", "vendor-y", FulfillmentStatus::Fulfilled))
            .await
            .unwrap();
        assert_eq!(line.qty_fulfilled, line.qty_ordered);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_same_line() {
        let f = fixture().await;
        let mut ship = request(&f, "merch-1", "vendor-x", FulfillmentStatus::Shipped);
        ship.expected_version = Some(0);
        let mut cancel = request(&f, "merch-1", "vendor-x", FulfillmentStatus::Cancelled);
        cancel.expected_version = Some(0);

        let (a, b) = tokio::join!(
            f.engine.set_fulfillment_status(ship),
            f.engine.set_fulfillment_status(cancel)
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(loser, CoreError::Conflict(_)));
        assert!(loser.is_retryable());

        let order = f.store.get_order(f.order_id).await.unwrap();
        assert_eq!(order.fulfillment_lines[&LineKey::from("merch-1")].version, 1);
    }

    #[tokio::test]
    async fn test_resubmission_is_audited_and_notes_attach() {
        let f = fixture().await;
        let mut req = request(&f, "merch-1", "vendor-x", FulfillmentStatus::Shipped);
        req.note = Some("left the warehouse".into());
        f.engine.set_fulfillment_status(req.clone()).await.unwrap();
        let line = f.engine.set_fulfillment_status(req).await.unwrap();

        assert_eq!(line.version, 2);
        assert_eq!(line.notes.len(), 2);
        let marked = f
            .timeline
            .events(f.order_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == TimelineKind::FulfillmentMarked)
            .count();
        assert_eq!(marked, 2);
    }

    /// Event appends fail while `failing` is set.
    struct FlakyTimeline {
        inner: InMemoryTimeline,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TimelineRepository for FlakyTimeline {
        async fn append_event(&self, event: &TimelineEvent) -> Result<(), CoreError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::Storage("timeline unavailable".into()));
            }
            self.inner.append_event(event).await
        }

        async fn events(&self, order_id: OrderId) -> Result<Vec<TimelineEvent>, CoreError> {
            self.inner.events(order_id).await
        }

        async fn append_note(&self, note: &Note) -> Result<(), CoreError> {
            self.inner.append_note(note).await
        }

        async fn notes(&self, order_id: OrderId) -> Result<Vec<Note>, CoreError> {
            self.inner.notes(order_id).await
        }
    }

    #[tokio::test]
    async fn test_terminal_update_survives_timeline_outage() {
        let f = fixture().await;
        let repo = Arc::new(FlakyTimeline {
            inner: InMemoryTimeline::new(),
            failing: std::sync::atomic::AtomicBool::new(true),
        });
        let engine = FulfillmentEngine::new(
            f.store.repository().clone(),
            Arc::new(Timeline::new(repo.clone(), f.clock.clone())),
            Arc::new(bazaar_core::LogEventPublisher),
            f.clock.clone(),
        );

        let line = engine
            .set_fulfillment_status(request(&f, "merch-1", "vendor-x", FulfillmentStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(line.status(), FulfillmentStatus::Cancelled);
        assert_eq!(line.version, 1);
        assert!(repo.inner.events(f.order_id).await.unwrap().is_empty());

        // The line stays terminal once the timeline is back.
        repo.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        let err = engine
            .set_fulfillment_status(request(&f, "merch-1", "vendor-x", FulfillmentStatus::Cancelled))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TerminalStateViolation { .. }));
        let order = f.store.get_order(f.order_id).await.unwrap();
        assert_eq!(order.fulfillment_lines[&LineKey::from("merch-1")].version, 1);
    }

    #[tokio::test]
    async fn test_missing_line_is_not_found() {
        let f = fixture().await;
        let err = f
            .engine
            .set_fulfillment_status(request(&f, "merch-9", "vendor-x", FulfillmentStatus::Shipped))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    fn any_status() -> impl Strategy<Value = FulfillmentStatus> {
        prop_oneof![
            Just(FulfillmentStatus::Unfulfilled),
            Just(FulfillmentStatus::Shipped),
            Just(FulfillmentStatus::Delivered),
            Just(FulfillmentStatus::Fulfilled),
            Just(FulfillmentStatus::Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_and_isolation_laws(
            steps in prop::collection::vec((any::<bool>(), any_status()), 1..12),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let f = fixture().await;
                let ticket_before = f.store.get_order(f.order_id).await.unwrap()
                    .fulfillment_lines[&LineKey::from("ticket-1")].clone();
                let mut terminal: Option<FulfillmentStatus> = None;

                for (as_owner, status) in steps {
                    let vendor = if as_owner { "vendor-x" } else { "vendor-y" };
                    let result = f.engine
                        .set_fulfillment_status(request(&f, "merch-1", vendor, status))
                        .await;
                    if terminal.is_some() {
                        prop_assert!(result.is_err());
                    }
                    let order = f.store.get_order(f.order_id).await.unwrap();
                    let merch = order.fulfillment_lines[&LineKey::from("merch-1")].status();
                    if let Some(t) = terminal {
                        prop_assert_eq!(merch, t);
                    } else if is_terminal(merch) {
                        terminal = Some(merch);
                    }
                    // Nobody ever writes vendor Y's line here.
                    prop_assert_eq!(&order.fulfillment_lines[&LineKey::from("ticket-1")], &ticket_before);
                }
                Ok(())
            })?;
        }
    }
}
