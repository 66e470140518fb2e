use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_order::models::{BuyerContact, FulfillmentLine, LineItem, LineItemKind, LineNote, Order, OrderAmount, OrderHeader, Shipping};
use bazaar_order::OrderRepository;
use bazaar_shared::pii::Masked;
use bazaar_shared::{EventId, LineKey, MerchItemId, OrderId, VendorId, VendorLineStatus};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    buyer_id: String,
    event_id: Option<String>,
    currency: String,
    status: String,
    items_subtotal_minor: i64,
    fees_minor: i64,
    total_minor: i64,
    deliver_to: Option<Json<BuyerContact>>,
    provider: String,
    provider_ref: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct LineItemRow {
    line_key: String,
    vendor_id: String,
    name: String,
    qty: i32,
    unit_price_minor: i64,
    subtotal_minor: i64,
    kind: Json<LineItemKind>,
}

#[derive(FromRow)]
struct FulfillmentRow {
    line_key: String,
    vendor_id: String,
    qty_ordered: i32,
    qty_fulfilled: i32,
    shipping: Json<Shipping>,
    vendor_status: String,
    notes: Json<Vec<LineNote>>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_header(self) -> Result<OrderHeader, CoreError> {
        Ok(OrderHeader {
            id: OrderId(self.id),
            buyer_id: self.buyer_id,
            event_id: self.event_id.map(EventId),
            currency: self.currency.parse().map_err(CoreError::storage)?,
            status: self.status.parse().map_err(CoreError::storage)?,
            amount: OrderAmount {
                items_subtotal_minor: self.items_subtotal_minor,
                fees_minor: self.fees_minor,
                total_minor: self.total_minor,
            },
            deliver_to: self.deliver_to.map(|Json(contact)| Masked::new(contact)),
            provider: self.provider,
            provider_ref: self.provider_ref,
            created_at: self.created_at,
        })
    }
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = CoreError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        Ok(LineItem {
            line_key: LineKey(row.line_key),
            vendor_id: VendorId(row.vendor_id),
            name: row.name,
            qty: to_u32(row.qty)?,
            unit_price_minor: row.unit_price_minor,
            subtotal_minor: row.subtotal_minor,
            kind: row.kind.0,
        })
    }
}

impl FulfillmentRow {
    fn into_line(self) -> Result<(FulfillmentLine, VendorLineStatus), CoreError> {
        let vendor_status = self.vendor_status.parse().map_err(CoreError::storage)?;
        let line = FulfillmentLine {
            line_key: LineKey(self.line_key),
            vendor_id: VendorId(self.vendor_id),
            qty_ordered: to_u32(self.qty_ordered)?,
            qty_fulfilled: to_u32(self.qty_fulfilled)?,
            shipping: self.shipping.0,
            notes: self.notes.0,
            version: u64::try_from(self.version).map_err(CoreError::storage)?,
            updated_at: self.updated_at,
        };
        Ok((line, vendor_status))
    }
}

fn to_u32(value: i32) -> Result<u32, CoreError> {
    u32::try_from(value).map_err(CoreError::storage)
}

fn to_i32(value: u32) -> Result<i32, CoreError> {
    i32::try_from(value).map_err(CoreError::storage)
}

fn to_i64(value: u64) -> Result<i64, CoreError> {
    i64::try_from(value).map_err(CoreError::storage)
}

const ORDER_COLUMNS: &str = "id, buyer_id, event_id, currency, status, items_subtotal_minor, fees_minor, \
     total_minor, deliver_to, provider, provider_ref, created_at";

const LINE_COLUMNS: &str =
    "line_key, vendor_id, qty_ordered, qty_fulfilled, shipping, vendor_status, notes, version, updated_at";

/// Orders in Postgres. Fulfillment lines live in their own table so a vendor
/// update locks one row, never the whole order.
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load(&self, row: OrderRow) -> Result<Order, CoreError> {
        let header = row.into_header()?;

        let items = sqlx::query_as::<_, LineItemRow>(
            "SELECT line_key, vendor_id, name, qty, unit_price_minor, subtotal_minor, kind \
             FROM order_line_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(header.id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;

        let lines = sqlx::query_as::<_, FulfillmentRow>(&format!(
            "SELECT {} FROM fulfillment_lines WHERE order_id = $1",
            LINE_COLUMNS
        ))
        .bind(header.id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;

        let line_items = items
            .into_iter()
            .map(LineItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut order = Order::new(header, line_items);
        for row in lines {
            let (line, vendor_status) = row.into_line()?;
            order.vendor_line_statuses.insert(line.line_key.clone(), vendor_status);
            order.fulfillment_lines.insert(line.line_key.clone(), line);
        }
        Ok(order)
    }

    async fn load_many(&self, rows: Vec<OrderRow>) -> Result<Vec<Order>, CoreError> {
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(self.load(row).await?);
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert_order(&self, order: &Order) -> Result<(), CoreError> {
        let header = &order.header;
        let mut tx = self.pool.begin().await.map_err(CoreError::storage)?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO orders ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO NOTHING",
            ORDER_COLUMNS
        ))
        .bind(header.id.0)
        .bind(&header.buyer_id)
        .bind(header.event_id.as_ref().map(|e| e.as_str()))
        .bind(header.currency.as_str())
        .bind(header.status.as_str())
        .bind(header.amount.items_subtotal_minor)
        .bind(header.amount.fees_minor)
        .bind(header.amount.total_minor)
        .bind(header.deliver_to.as_ref().map(|contact| Json(contact.expose())))
        .bind(&header.provider)
        .bind(header.provider_ref.as_deref())
        .bind(header.created_at)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::storage)?;

        if inserted.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!("order {} already exists", header.id)));
        }

        for (position, item) in order.line_items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_line_items \
                 (order_id, line_key, position, vendor_id, name, qty, unit_price_minor, subtotal_minor, kind, merch_item_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(header.id.0)
            .bind(item.line_key.as_str())
            .bind(i32::try_from(position).map_err(CoreError::storage)?)
            .bind(item.vendor_id.as_str())
            .bind(&item.name)
            .bind(to_i32(item.qty)?)
            .bind(item.unit_price_minor)
            .bind(item.subtotal_minor)
            .bind(Json(&item.kind))
            .bind(item.merch_item_id().map(|m| m.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(CoreError::storage)?;
        }

        tx.commit().await.map_err(CoreError::storage)?;
        debug!(order_id = %header.id, items = order.line_items.len(), "order row written");
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, CoreError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(order_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::storage)?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn seed_fulfillment_lines(&self, order_id: OrderId, lines: Vec<FulfillmentLine>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(CoreError::storage)?;

        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(CoreError::storage)?;
        if locked.is_none() {
            return Err(CoreError::NotFound(format!("order {}", order_id)));
        }

        let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fulfillment_lines WHERE order_id = $1")
            .bind(order_id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(CoreError::storage)?;
        if existing > 0 {
            return Err(CoreError::Conflict(format!(
                "fulfillment lines for order {} are already seeded",
                order_id
            )));
        }

        for line in &lines {
            sqlx::query(&format!(
                "INSERT INTO fulfillment_lines (order_id, status, {}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                LINE_COLUMNS
            ))
            .bind(order_id.0)
            .bind(line.status().as_str())
            .bind(line.line_key.as_str())
            .bind(line.vendor_id.as_str())
            .bind(to_i32(line.qty_ordered)?)
            .bind(to_i32(line.qty_fulfilled)?)
            .bind(Json(&line.shipping))
            .bind(line.vendor_status().as_str())
            .bind(Json(&line.notes))
            .bind(to_i64(line.version)?)
            .bind(line.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::storage)?;
        }

        tx.commit().await.map_err(CoreError::storage)?;
        Ok(())
    }

    async fn get_line(&self, order_id: OrderId, line_key: &LineKey) -> Result<Option<FulfillmentLine>, CoreError> {
        let row = sqlx::query_as::<_, FulfillmentRow>(&format!(
            "SELECT {} FROM fulfillment_lines WHERE order_id = $1 AND line_key = $2",
            LINE_COLUMNS
        ))
        .bind(order_id.0)
        .bind(line_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::storage)?;

        row.map(|r| r.into_line().map(|(line, _)| line)).transpose()
    }

    async fn update_line(
        &self,
        order_id: OrderId,
        line_key: &LineKey,
        expected_version: u64,
        line: FulfillmentLine,
        vendor_status: VendorLineStatus,
    ) -> Result<FulfillmentLine, CoreError> {
        let updated = sqlx::query(
            "UPDATE fulfillment_lines \
             SET qty_fulfilled = $3, shipping = $4, status = $5, vendor_status = $6, notes = $7, \
                 version = $8, updated_at = $9 \
             WHERE order_id = $1 AND line_key = $2 AND version = $10",
        )
        .bind(order_id.0)
        .bind(line_key.as_str())
        .bind(to_i32(line.qty_fulfilled)?)
        .bind(Json(&line.shipping))
        .bind(line.status().as_str())
        .bind(vendor_status.as_str())
        .bind(Json(&line.notes))
        .bind(to_i64(line.version)?)
        .bind(line.updated_at)
        .bind(to_i64(expected_version)?)
        .execute(&self.pool)
        .await
        .map_err(CoreError::storage)?;

        if updated.rows_affected() == 0 {
            return match self.get_line(order_id, line_key).await? {
                None => Err(CoreError::NotFound(format!("line {} on order {}", line_key, order_id))),
                Some(current) => Err(CoreError::Conflict(format!(
                    "line {} is at version {}, expected {}",
                    line_key, current.version, expected_version
                ))),
            };
        }
        Ok(line)
    }

    async fn list_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders o WHERE EXISTS \
             (SELECT 1 FROM order_line_items i WHERE i.order_id = o.id AND i.vendor_id = $1) \
             ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(vendor_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        self.load_many(rows).await
    }

    async fn list_for_event(&self, event_id: &EventId) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE event_id = $1 ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(event_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        self.load_many(rows).await
    }

    async fn list_for_merch_items(&self, items: &[MerchItemId]) -> Result<Vec<Order>, CoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = items.iter().map(|m| m.0.clone()).collect();
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders o WHERE EXISTS \
             (SELECT 1 FROM order_line_items i WHERE i.order_id = o.id AND i.merch_item_id = ANY($1)) \
             ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        self.load_many(rows).await
    }
}
