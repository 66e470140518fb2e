use bazaar_core::{Clock, CoreError, CoreResult, ViewerContext};
use bazaar_shared::{FulfillmentStatus, LineKey, MinorUnits, OrderId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::models::{FulfillmentLine, FulfillmentSeed, LineItem, Order, OrderHeader, Shipping};
use crate::repository::OrderRepository;

/// Owns order creation and seeding; after that, lines only change through
/// the fulfillment engine.
pub struct OrderStore {
    repo: Arc<dyn OrderRepository>,
    clock: Arc<dyn Clock>,
}

impl OrderStore {
    pub fn new(repo: Arc<dyn OrderRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repo
    }

    /// Create an order from a confirmed checkout
    pub async fn create_order(&self, header: OrderHeader, line_items: Vec<LineItem>) -> CoreResult<Order> {
        validate_line_items(&header, &line_items)?;
        let order = Order::new(header, line_items);
        self.repo.insert_order(&order).await?;

        info!(
            order_id = %order.id(),
            lines = order.line_items.len(),
            total_minor = order.header.amount.total_minor,
            "order created"
        );
        Ok(order)
    }

    /// Get an order by ID
    pub async fn get_order(&self, order_id: OrderId) -> CoreResult<Order> {
        self.repo
            .get_order(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))
    }

    /// Seed one fulfillment line per line item. Runs once per order.
    pub async fn append_fulfillment_lines(&self, order_id: OrderId, seeds: Vec<FulfillmentSeed>) -> CoreResult<Order> {
        let order = self.get_order(order_id).await?;
        if order.is_seeded() {
            return Err(CoreError::Conflict(format!(
                "order {} already has fulfillment lines",
                order_id
            )));
        }
        let lines = build_fulfillment_lines(&order, &seeds, self.clock.now())?;
        self.repo
            .seed_fulfillment_lines(order_id, lines.into_values().collect())
            .await?;

        info!(%order_id, lines = seeds.len(), "fulfillment lines seeded");
        self.get_order(order_id).await
    }

    /// Every order the viewer can see at least one line of, oldest first.
    pub async fn list_for_viewer(&self, viewer: &ViewerContext) -> CoreResult<Vec<Order>> {
        let mut orders = self.repo.list_for_vendor(&viewer.viewer_id).await?;

        for (event_id, role) in &viewer.event_roles {
            if role.is_organizer() {
                orders.extend(self.repo.list_for_event(event_id).await?);
            }
        }
        if !viewer.brand_items.is_empty() {
            let items: Vec<_> = viewer.brand_items.iter().cloned().collect();
            orders.extend(self.repo.list_for_merch_items(&items).await?);
        }

        let mut seen = HashSet::new();
        orders.retain(|order| seen.insert(order.id()));
        orders.sort_by_key(|order| order.header.created_at);
        Ok(orders)
    }
}

/// Line keys unique, every subtotal equal to `qty * unit_price`, and the
/// header's item subtotal equal to their sum. All arithmetic is checked.
pub fn validate_line_items(header: &OrderHeader, items: &[LineItem]) -> CoreResult<()> {
    if items.is_empty() {
        return Err(CoreError::Invalid("an order needs at least one line item".into()));
    }

    let mut keys = HashSet::new();
    let mut items_subtotal: MinorUnits = 0;
    for item in items {
        if !keys.insert(&item.line_key) {
            return Err(CoreError::DuplicateLineKey(item.line_key.to_string()));
        }
        if item.qty == 0 || item.unit_price_minor < 0 {
            return Err(CoreError::InvalidAmount(format!(
                "line {} needs a positive quantity and a non-negative price",
                item.line_key
            )));
        }
        let expected = item.expected_subtotal().ok_or_else(|| {
            CoreError::InvalidAmount(format!("line {} subtotal overflows", item.line_key))
        })?;
        if expected != item.subtotal_minor {
            return Err(CoreError::InvalidAmount(format!(
                "line {} subtotal is {}, expected {} x {} = {}",
                item.line_key, item.subtotal_minor, item.qty, item.unit_price_minor, expected
            )));
        }
        items_subtotal = items_subtotal
            .checked_add(expected)
            .ok_or_else(|| CoreError::InvalidAmount("items subtotal overflows".into()))?;
    }

    let amount = &header.amount;
    if amount.items_subtotal_minor != items_subtotal {
        return Err(CoreError::InvalidAmount(format!(
            "items subtotal is {}, line items add up to {}",
            amount.items_subtotal_minor, items_subtotal
        )));
    }
    if amount.fees_minor < 0 {
        return Err(CoreError::InvalidAmount("fees cannot be negative".into()));
    }
    Ok(())
}

/// Build the initial lines for `order`, checking each seed against its line
/// item and the order total against subtotal, fees and shipping.
pub fn build_fulfillment_lines(
    order: &Order,
    seeds: &[FulfillmentSeed],
    now: DateTime<Utc>,
) -> CoreResult<BTreeMap<LineKey, FulfillmentLine>> {
    let mut lines = BTreeMap::new();
    let mut shipping_total: MinorUnits = 0;

    for seed in seeds {
        if lines.contains_key(&seed.line_key) {
            return Err(CoreError::DuplicateLineKey(seed.line_key.to_string()));
        }
        let item = order.line_item(&seed.line_key).ok_or_else(|| {
            CoreError::NotFound(format!("line item {} on order {}", seed.line_key, order.id()))
        })?;
        if item.vendor_id != seed.vendor_id {
            return Err(CoreError::NotOwner {
                line_key: seed.line_key.to_string(),
                requested_by: seed.vendor_id.to_string(),
            });
        }
        if seed.qty_ordered != item.qty {
            return Err(CoreError::InvalidQuantity {
                line_key: seed.line_key.to_string(),
                requested: i64::from(seed.qty_ordered),
                max: item.qty,
            });
        }
        if seed.fee_minor < 0 {
            return Err(CoreError::InvalidAmount(format!(
                "shipping fee for line {} cannot be negative",
                seed.line_key
            )));
        }
        shipping_total = shipping_total
            .checked_add(seed.fee_minor)
            .ok_or_else(|| CoreError::InvalidAmount("shipping total overflows".into()))?;

        lines.insert(
            seed.line_key.clone(),
            FulfillmentLine {
                line_key: seed.line_key.clone(),
                vendor_id: seed.vendor_id.clone(),
                qty_ordered: seed.qty_ordered,
                qty_fulfilled: 0,
                shipping: Shipping {
                    method: seed.method.clone(),
                    tracking_number: None,
                    carrier: None,
                    fee_minor: seed.fee_minor,
                    status: FulfillmentStatus::Unfulfilled,
                },
                notes: Vec::new(),
                version: 0,
                updated_at: now,
            },
        );
    }

    if let Some(missing) = order.line_items.iter().find(|item| !lines.contains_key(&item.line_key)) {
        return Err(CoreError::Invalid(format!(
            "line item {} has no fulfillment line",
            missing.line_key
        )));
    }

    let amount = &order.header.amount;
    let expected_total = amount
        .items_subtotal_minor
        .checked_add(amount.fees_minor)
        .and_then(|sum| sum.checked_add(shipping_total))
        .ok_or_else(|| CoreError::InvalidAmount("order total overflows".into()))?;
    if amount.total_minor != expected_total {
        return Err(CoreError::InvalidAmount(format!(
            "order total is {}, expected items {} + fees {} + shipping {} = {}",
            amount.total_minor, amount.items_subtotal_minor, amount.fees_minor, shipping_total, expected_total
        )));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShippingMethod;
    use crate::testing::{header, scenario_items, scenario_seeds, stores};
    use bazaar_core::EventRole;
    use bazaar_shared::{EventId, MerchItemId, OrderStatus, VendorId};
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_create_and_seed_scenario_order() {
        let (store, _) = stores();
        let order = store
            .create_order(header(7000, 0, 7500), scenario_items())
            .await
            .unwrap();
        assert_eq!(order.header.amount.items_subtotal_minor, 7000);
        assert!(!order.is_seeded());

        let seeded = store.append_fulfillment_lines(order.id(), scenario_seeds()).await.unwrap();
        assert_eq!(seeded.fulfillment_lines.len(), 2);
        assert!(seeded.fulfillment_lines.values().all(|l| l.version == 0 && l.qty_fulfilled == 0));
        assert!(seeded
            .vendor_line_statuses
            .values()
            .all(|s| *s == bazaar_shared::VendorLineStatus::Paid));
        assert_eq!(seeded.progress_status(), OrderStatus::Paid);

        let again = store.append_fulfillment_lines(order.id(), scenario_seeds()).await.unwrap_err();
        assert!(matches!(again, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_subtotals_and_duplicate_keys() {
        let (store, _) = stores();

        let mut items = scenario_items();
        items[0].subtotal_minor = 1999;
        let err = store.create_order(header(6999, 0, 6999), items).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));

        let err = store.create_order(header(6000, 0, 6000), scenario_items()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));

        let mut items = scenario_items();
        items[1].line_key = items[0].line_key.clone();
        let err = store.create_order(header(7000, 0, 7000), items).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateLineKey(_)));
    }

    #[tokio::test]
    async fn test_seed_validation() {
        let (store, _) = stores();
        let order = store.create_order(header(7000, 0, 7500), scenario_items()).await.unwrap();

        let mut seeds = scenario_seeds();
        seeds[0].vendor_id = VendorId::new("vendor-y");
        let err = store.append_fulfillment_lines(order.id(), seeds).await.unwrap_err();
        assert!(matches!(err, CoreError::NotOwner { .. }));

        let mut seeds = scenario_seeds();
        seeds[0].qty_ordered = 3;
        let err = store.append_fulfillment_lines(order.id(), seeds).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuantity { .. }));

        let mut seeds = scenario_seeds();
        seeds[0].fee_minor = 100;
        let err = store.append_fulfillment_lines(order.id(), seeds).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));

        let mut seeds = scenario_seeds();
        seeds.push(FulfillmentSeed {
            line_key: "merch-9".into(),
            vendor_id: "vendor-x".into(),
            qty_ordered: 1,
            method: ShippingMethod::Digital,
            fee_minor: 0,
        });
        let err = store.append_fulfillment_lines(order.id(), seeds).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));

        let mut seeds = scenario_seeds();
        seeds.push(seeds[0].clone());
        let err = store.append_fulfillment_lines(order.id(), seeds).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateLineKey(_)));

        // Nothing above left partial state behind.
        assert!(!store.get_order(order.id()).await.unwrap().is_seeded());
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let (store, _) = stores();
        let err = store.get_order(OrderId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_for_viewer_unions_roles() {
        let (store, _) = stores();
        let order = store.create_order(header(7000, 0, 7500), scenario_items()).await.unwrap();
        store.append_fulfillment_lines(order.id(), scenario_seeds()).await.unwrap();

        let organizer = ViewerContext::new(VendorId::new("org-1"))
            .with_event_role(EventId::new("evt-1"), EventRole::Owner);
        assert_eq!(store.list_for_viewer(&organizer).await.unwrap().len(), 1);

        let brand = ViewerContext::new(VendorId::new("vendor-x")).with_brand_item(MerchItemId::new("shirt-01"));
        assert_eq!(store.list_for_viewer(&brand).await.unwrap().len(), 1);

        let stranger = ViewerContext::new(VendorId::new("vendor-z"));
        assert!(store.list_for_viewer(&stranger).await.unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_subtotal_invariant(qty in 1u32..10_000, unit in 0i64..1_000_000, skew in -5i64..5) {
            let mut items = scenario_items();
            items.truncate(1);
            items[0].qty = qty;
            items[0].unit_price_minor = unit;
            items[0].subtotal_minor = i64::from(qty) * unit + skew;
            let subtotal = items[0].subtotal_minor;

            let result = validate_line_items(&header(subtotal, 0, subtotal), &items);
            prop_assert_eq!(result.is_ok(), skew == 0);
        }
    }
}
