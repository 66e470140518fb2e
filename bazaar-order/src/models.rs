use bazaar_core::Actor;
use bazaar_shared::pii::Masked;
use bazaar_shared::{
    Currency, EventId, FulfillmentStatus, LineKey, MerchItemId, MinorUnits, OrderId, OrderStatus,
    TicketTypeId, VendorId, VendorLineStatus,
};
use bazaar_wallet::EarningsSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What was bought on a line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineItemKind {
    Ticket {
        ticket_type_id: TicketTypeId,
    },
    Merch {
        merch_item_id: MerchItemId,
        #[serde(default)]
        variant: Option<String>,
    },
}

/// One purchased unit of sale. Immutable once the order exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    pub line_key: LineKey,
    pub vendor_id: VendorId,
    pub name: String,
    pub qty: u32,
    pub unit_price_minor: MinorUnits,
    pub subtotal_minor: MinorUnits,
    pub kind: LineItemKind,
}

impl LineItem {
    /// `qty * unit_price_minor`, or `None` on overflow.
    pub fn expected_subtotal(&self) -> Option<MinorUnits> {
        self.unit_price_minor.checked_mul(i64::from(self.qty))
    }

    pub fn merch_item_id(&self) -> Option<&MerchItemId> {
        match &self.kind {
            LineItemKind::Merch { merch_item_id, .. } => Some(merch_item_id),
            LineItemKind::Ticket { .. } => None,
        }
    }

    pub fn earnings_source(&self) -> EarningsSource {
        match self.kind {
            LineItemKind::Ticket { .. } => EarningsSource::Event,
            LineItemKind::Merch { .. } => EarningsSource::Store,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderAmount {
    pub items_subtotal_minor: MinorUnits,
    pub fees_minor: MinorUnits,
    pub total_minor: MinorUnits,
}

/// Buyer contact details; only ever logged masked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuyerContact {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderHeader {
    pub id: OrderId,
    pub buyer_id: String,
    #[serde(default)]
    pub event_id: Option<EventId>,
    pub currency: Currency,
    pub status: OrderStatus,
    pub amount: OrderAmount,
    #[serde(default)]
    pub deliver_to: Option<Masked<BuyerContact>>,
    pub provider: String,
    #[serde(default)]
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShippingMethod {
    Delivery { address: String },
    Pickup { location: String },
    Digital,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shipping {
    pub method: ShippingMethod,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub fee_minor: MinorUnits,
    pub status: FulfillmentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineNote {
    pub author: Actor,
    pub at: DateTime<Utc>,
    pub body: String,
}

/// One vendor's mutable record for one line item. Only `vendor_id` may write it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfillmentLine {
    pub line_key: LineKey,
    pub vendor_id: VendorId,
    pub qty_ordered: u32,
    pub qty_fulfilled: u32,
    pub shipping: Shipping,
    #[serde(default)]
    pub notes: Vec<LineNote>,
    /// Bumped on every write; compared on update.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl FulfillmentLine {
    pub fn status(&self) -> FulfillmentStatus {
        self.shipping.status
    }

    pub fn vendor_status(&self) -> VendorLineStatus {
        coarsen(self.shipping.status)
    }
}

/// How a line should be fulfilled, as agreed at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfillmentSeed {
    pub line_key: LineKey,
    pub vendor_id: VendorId,
    pub qty_ordered: u32,
    pub method: ShippingMethod,
    #[serde(default)]
    pub fee_minor: MinorUnits,
}

/// One checkout transaction spanning any number of vendors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    #[serde(flatten)]
    pub header: OrderHeader,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub fulfillment_lines: BTreeMap<LineKey, FulfillmentLine>,
    #[serde(default)]
    pub vendor_line_statuses: BTreeMap<LineKey, VendorLineStatus>,
}

impl Order {
    pub fn new(header: OrderHeader, line_items: Vec<LineItem>) -> Self {
        Self {
            header,
            line_items,
            fulfillment_lines: BTreeMap::new(),
            vendor_line_statuses: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> OrderId {
        self.header.id
    }

    pub fn line_item(&self, line_key: &LineKey) -> Option<&LineItem> {
        self.line_items.iter().find(|item| &item.line_key == line_key)
    }

    pub fn vendor_ids(&self) -> BTreeSet<VendorId> {
        self.line_items.iter().map(|item| item.vendor_id.clone()).collect()
    }

    pub fn is_seeded(&self) -> bool {
        !self.fulfillment_lines.is_empty()
    }

    /// Order-level status as seen by the buyer. The stored header stays at
    /// `paid`; progress is read off the fulfillment lines.
    pub fn progress_status(&self) -> OrderStatus {
        if self.header.status != OrderStatus::Paid || self.fulfillment_lines.is_empty() {
            return self.header.status;
        }
        let statuses: Vec<FulfillmentStatus> =
            self.fulfillment_lines.values().map(|line| line.status()).collect();

        if statuses.iter().all(|s| *s == FulfillmentStatus::Cancelled) {
            OrderStatus::Cancelled
        } else if statuses
            .iter()
            .all(|s| matches!(s, FulfillmentStatus::Fulfilled | FulfillmentStatus::Cancelled))
        {
            OrderStatus::Fulfilled
        } else if statuses.iter().any(|s| *s != FulfillmentStatus::Unfulfilled) {
            OrderStatus::PartiallyFulfilled
        } else {
            OrderStatus::Paid
        }
    }
}

/// Coarse label shown to viewers who do not own the line.
pub fn coarsen(status: FulfillmentStatus) -> VendorLineStatus {
    match status {
        FulfillmentStatus::Unfulfilled => VendorLineStatus::Paid,
        FulfillmentStatus::Shipped | FulfillmentStatus::Delivered => VendorLineStatus::Shipped,
        FulfillmentStatus::Fulfilled => VendorLineStatus::Fulfilled,
        FulfillmentStatus::Cancelled => VendorLineStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_item_kind_wire_shape() {
        let json = serde_json::json!({
            "line_key": "merch-1",
            "vendor_id": "vendor-x",
            "name": "Tour shirt",
            "qty": 2,
            "unit_price_minor": 1000,
            "subtotal_minor": 2000,
            "kind": { "type": "merch", "merch_item_id": "shirt-01", "variant": "L" }
        });
        let item: LineItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.merch_item_id().unwrap().as_str(), "shirt-01");
        assert_eq!(item.expected_subtotal(), Some(2000));
        assert_eq!(item.earnings_source(), EarningsSource::Store);
    }

    #[test]
    fn test_subtotal_overflow_is_detected() {
        let item = LineItem {
            line_key: "t-1".into(),
            vendor_id: "vendor-y".into(),
            name: "VIP".into(),
            qty: u32::MAX,
            unit_price_minor: i64::MAX / 2,
            subtotal_minor: 0,
            kind: LineItemKind::Ticket {
                ticket_type_id: "vip".into(),
            },
        };
        assert_eq!(item.expected_subtotal(), None);
    }

    #[test]
    fn test_coarsen() {
        assert_eq!(coarsen(FulfillmentStatus::Unfulfilled), VendorLineStatus::Paid);
        assert_eq!(coarsen(FulfillmentStatus::Delivered), VendorLineStatus::Shipped);
        assert_eq!(coarsen(FulfillmentStatus::Cancelled), VendorLineStatus::Cancelled);
    }
}
