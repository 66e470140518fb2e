use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_shared::{EventId, LineKey, MerchItemId, OrderId, VendorId, VendorLineStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{FulfillmentLine, Order};
use crate::repository::OrderRepository;

#[derive(Default)]
pub struct InMemoryOrders {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered(&self, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| keep(order))
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.header.created_at);
        orders
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrders {
    async fn insert_order(&self, order: &Order) -> Result<(), CoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id()) {
            return Err(CoreError::Conflict(format!("order {} already exists", order.id())));
        }
        orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, CoreError> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn seed_fulfillment_lines(
        &self,
        order_id: OrderId,
        lines: Vec<FulfillmentLine>,
    ) -> Result<(), CoreError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        if order.is_seeded() {
            return Err(CoreError::Conflict(format!(
                "order {} already has fulfillment lines",
                order_id
            )));
        }
        for line in lines {
            order
                .vendor_line_statuses
                .insert(line.line_key.clone(), line.vendor_status());
            order.fulfillment_lines.insert(line.line_key.clone(), line);
        }
        Ok(())
    }

    async fn get_line(&self, order_id: OrderId, line_key: &LineKey) -> Result<Option<FulfillmentLine>, CoreError> {
        Ok(self
            .orders
            .read()
            .await
            .get(&order_id)
            .and_then(|order| order.fulfillment_lines.get(line_key))
            .cloned())
    }

    async fn update_line(
        &self,
        order_id: OrderId,
        line_key: &LineKey,
        expected_version: u64,
        line: FulfillmentLine,
        vendor_status: VendorLineStatus,
    ) -> Result<FulfillmentLine, CoreError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        let current = order
            .fulfillment_lines
            .get_mut(line_key)
            .ok_or_else(|| CoreError::NotFound(format!("line {} on order {}", line_key, order_id)))?;

        if current.version != expected_version {
            return Err(CoreError::Conflict(format!(
                "line {} is at version {}, expected {}",
                line_key, current.version, expected_version
            )));
        }
        *current = line.clone();
        order.vendor_line_statuses.insert(line_key.clone(), vendor_status);
        Ok(line)
    }

    async fn list_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<Order>, CoreError> {
        Ok(self
            .filtered(|order| order.line_items.iter().any(|item| &item.vendor_id == vendor_id))
            .await)
    }

    async fn list_for_event(&self, event_id: &EventId) -> Result<Vec<Order>, CoreError> {
        Ok(self
            .filtered(|order| order.header.event_id.as_ref() == Some(event_id))
            .await)
    }

    async fn list_for_merch_items(&self, items: &[MerchItemId]) -> Result<Vec<Order>, CoreError> {
        Ok(self
            .filtered(|order| {
                order
                    .line_items
                    .iter()
                    .filter_map(|item| item.merch_item_id())
                    .any(|id| items.contains(id))
            })
            .await)
    }
}
