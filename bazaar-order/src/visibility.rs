//! Per-viewer projection of a shared order.
//!
//! Pure and read-only; safe to run on a stale snapshot.

use bazaar_core::ViewerContext;
use bazaar_shared::{Currency, EventId, OrderId, OrderStatus, VendorLineStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{coarsen, FulfillmentLine, LineItem, Order};

/// Why the viewer may see this order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityReason {
    /// Only through lines the viewer sells.
    Vendor,
    Organizer,
    Brand,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisibleLine {
    pub item: LineItem,
    pub vendor_status: VendorLineStatus,
    pub owned: bool,
    /// Full operational record, only for the owning vendor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<FulfillmentLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderView {
    pub order_id: OrderId,
    pub event_id: Option<EventId>,
    pub currency: Currency,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub visibility_reason: VisibilityReason,
    /// Aggregate over the visible lines.
    pub vendor_status: VendorLineStatus,
    pub lines: Vec<VisibleLine>,
}

/// Shape `order` for `viewer`, or `None` when no line is visible to them.
pub fn resolve_view(order: &Order, viewer: &ViewerContext) -> Option<OrderView> {
    let organizer = order
        .header
        .event_id
        .as_ref()
        .is_some_and(|event_id| viewer.is_organizer_of(event_id));

    let mut via_brand = false;
    let mut lines = Vec::new();
    for item in &order.line_items {
        let owned = item.vendor_id == viewer.viewer_id;
        let brand = item
            .merch_item_id()
            .is_some_and(|merch| viewer.owns_brand_item(merch));
        if !(owned || organizer || brand) {
            continue;
        }
        via_brand |= brand;

        let fulfillment = order.fulfillment_lines.get(&item.line_key);
        let vendor_status = order
            .vendor_line_statuses
            .get(&item.line_key)
            .copied()
            .or_else(|| fulfillment.map(|line| coarsen(line.status())))
            .unwrap_or(VendorLineStatus::Paid);

        lines.push(VisibleLine {
            item: item.clone(),
            vendor_status,
            owned,
            fulfillment: if owned { fulfillment.cloned() } else { None },
        });
    }

    if lines.is_empty() {
        return None;
    }

    let visibility_reason = match (organizer, via_brand) {
        (true, true) => VisibilityReason::Both,
        (true, false) => VisibilityReason::Organizer,
        (false, true) => VisibilityReason::Brand,
        (false, false) => VisibilityReason::Vendor,
    };
    let statuses: Vec<VendorLineStatus> = lines.iter().map(|l| l.vendor_status).collect();

    Some(OrderView {
        order_id: order.id(),
        event_id: order.header.event_id.clone(),
        currency: order.header.currency.clone(),
        status: order.progress_status(),
        created_at: order.header.created_at,
        visibility_reason,
        vendor_status: aggregate_status(&statuses),
        lines,
    })
}

/// All cancelled: cancelled. All done or cancelled: fulfilled. Any shipped
/// or fulfilled: shipped. Otherwise paid.
pub fn aggregate_status(statuses: &[VendorLineStatus]) -> VendorLineStatus {
    use VendorLineStatus::*;
    if statuses.is_empty() {
        return Paid;
    }
    if statuses.iter().all(|s| *s == Cancelled) {
        Cancelled
    } else if statuses.iter().all(|s| matches!(s, Fulfilled | Cancelled)) {
        Fulfilled
    } else if statuses.iter().any(|s| matches!(s, Shipped | Fulfilled)) {
        Shipped
    } else {
        Paid
    }
}
