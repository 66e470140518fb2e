use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use bazaar_order::{resolve_view, ConfirmedOrder, ConfirmedPayment, FulfillmentLine, Order, OrderView, SetFulfillmentStatus};
use bazaar_shared::{FulfillmentStatus, LineKey, OrderId};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FulfillmentRequest {
    pub status: FulfillmentStatus,
    #[serde(default)]
    pub qty_fulfilled: Option<i64>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/confirmed", post(confirm_payment))
        .route("/v1/orders", get(list_orders))
        .route("/v1/orders/{id}", get(get_order))
        .route("/v1/orders/{id}/lines/{line_key}/fulfillment", post(set_fulfillment))
}

// ============================================================================
// Handlers
// ============================================================================

/// Intake from the payment collaborator once a checkout is paid.
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payment): Json<ConfirmedPayment>,
) -> Result<(StatusCode, Json<ConfirmedOrder>), AppError> {
    claims.require(&[Role::System])?;
    let confirmed = state.checkout.confirm_payment(payment).await?;
    Ok((StatusCode::CREATED, Json(confirmed)))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<OrderView>>, AppError> {
    let viewer = claims.viewer();
    let orders = state.orders.list_for_viewer(&viewer).await?;
    Ok(Json(orders.iter().filter_map(|order| resolve_view(order, &viewer)).collect()))
}

pub async fn get_order(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderView>, AppError> {
    let order = state.orders.get_order(OrderId(order_id)).await?;
    resolve_view(&order, &claims.viewer())
        .map(Json)
        .ok_or_else(|| AppError::Forbidden("no line of this order is visible to you".into()))
}

/// `If-Match` carries the line version the caller last saw; the new version
/// comes back as the `ETag`.
pub async fn set_fulfillment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((order_id, line_key)): Path<(Uuid, String)>,
    headers: HeaderMap,
    Json(body): Json<FulfillmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    claims.require(&[Role::Vendor])?;

    let expected_version = headers
        .get(header::IF_MATCH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(parse_etag)
                .ok_or_else(|| AppError::BadRequest("If-Match must be a line version".into()))
        })
        .transpose()?;
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let line: FulfillmentLine = state
        .fulfillment
        .set_fulfillment_status(SetFulfillmentStatus {
            order_id: OrderId(order_id),
            line_key: LineKey(line_key),
            requested_by: claims.vendor_id(),
            status: body.status,
            qty_fulfilled: body.qty_fulfilled,
            tracking_number: body.tracking_number,
            carrier: body.carrier,
            note: body.note,
            expected_version,
            idempotency_key,
        })
        .await?;

    let etag = format!("\"{}\"", line.version);
    Ok(([(header::ETAG, etag)], Json(line)))
}

/// Accepts `"3"`, `W/"3"` or a bare `3`.
fn parse_etag(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').parse().ok()
}

/// Full order for callers allowed to see any part of it: back-office roles,
/// or anyone the visibility resolver lets in.
pub(crate) async fn visible_order(state: &AppState, claims: &Claims, order_id: OrderId) -> Result<Order, AppError> {
    let order = state.orders.get_order(order_id).await?;
    if matches!(claims.role, Role::Operator | Role::System) || resolve_view(&order, &claims.viewer()).is_some() {
        Ok(order)
    } else {
        Err(AppError::Forbidden("no line of this order is visible to you".into()))
    }
}
