use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_shared::{EventId, LineKey, MerchItemId, OrderId, VendorId, VendorLineStatus};

use crate::models::{FulfillmentLine, Order};

/// Order persistence. After seeding, the only write path is `update_line`,
/// which touches one fulfillment line and its status projection.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Store a new order without fulfillment lines. `Conflict` if the id exists.
    async fn insert_order(&self, order: &Order) -> Result<(), CoreError>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, CoreError>;

    /// Write the initial fulfillment lines. `Conflict` if already seeded.
    async fn seed_fulfillment_lines(
        &self,
        order_id: OrderId,
        lines: Vec<FulfillmentLine>,
    ) -> Result<(), CoreError>;

    async fn get_line(&self, order_id: OrderId, line_key: &LineKey) -> Result<Option<FulfillmentLine>, CoreError>;

    /// Compare-and-swap one line. Fails `Conflict` unless the stored version
    /// equals `expected_version`; `line.version` must already be bumped.
    async fn update_line(
        &self,
        order_id: OrderId,
        line_key: &LineKey,
        expected_version: u64,
        line: FulfillmentLine,
        vendor_status: VendorLineStatus,
    ) -> Result<FulfillmentLine, CoreError>;

    async fn list_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<Order>, CoreError>;

    async fn list_for_event(&self, event_id: &EventId) -> Result<Vec<Order>, CoreError>;

    async fn list_for_merch_items(&self, items: &[MerchItemId]) -> Result<Vec<Order>, CoreError>;
}
