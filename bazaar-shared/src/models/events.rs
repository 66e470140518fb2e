use serde::{Deserialize, Serialize};

use crate::ids::{EntryId, LineKey, OrderId, PayoutBatchId, VendorId};
use crate::money::MinorUnits;
use crate::status::FulfillmentStatus;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrderCreatedEvent {
    pub order_id: OrderId,
    pub vendor_ids: Vec<VendorId>,
    pub total_minor: MinorUnits,
    pub currency: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FulfillmentMarkedEvent {
    pub order_id: OrderId,
    pub line_key: LineKey,
    pub vendor_id: VendorId,
    pub status: FulfillmentStatus,
    pub qty_fulfilled: u32,
    pub version: u64,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HoldReleasedEvent {
    pub vendor_id: VendorId,
    pub hold_entry_id: EntryId,
    pub amount_minor: MinorUnits,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PayoutSettledEvent {
    pub vendor_id: VendorId,
    pub batch_id: PayoutBatchId,
    pub amount_minor: MinorUnits,
    pub succeeded: bool,
    pub timestamp: i64,
}

/// Everything this core announces on the event bus.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderCreated(OrderCreatedEvent),
    FulfillmentMarked(FulfillmentMarkedEvent),
    HoldReleased(HoldReleasedEvent),
    PayoutSettled(PayoutSettledEvent),
}

impl DomainEvent {
    /// Topic suffix, e.g. `bazaar.fulfillment_marked`.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated(_) => "order_created",
            DomainEvent::FulfillmentMarked(_) => "fulfillment_marked",
            DomainEvent::HoldReleased(_) => "hold_released",
            DomainEvent::PayoutSettled(_) => "payout_settled",
        }
    }

    /// Partition key; keeps one order's (or vendor's) events in sequence.
    pub fn key(&self) -> String {
        match self {
            DomainEvent::OrderCreated(e) => e.order_id.to_string(),
            DomainEvent::FulfillmentMarked(e) => e.order_id.to_string(),
            DomainEvent::HoldReleased(e) => e.vendor_id.to_string(),
            DomainEvent::PayoutSettled(e) => e.vendor_id.to_string(),
        }
    }
}
