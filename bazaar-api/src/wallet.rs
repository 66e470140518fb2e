use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use bazaar_core::payout_rail::{BankAccount, TransferStatus};
use bazaar_shared::EntryId;
use bazaar_wallet::{
    BalanceCheck, EarningsSource, PayoutFrequency, PayoutSchedule, PayoutSettings, WalletLedgerEntry, WalletSummary,
    WeeklyWindow,
};
use chrono::Weekday;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub source: Option<EarningsSource>,
}

#[derive(Debug, Deserialize)]
pub struct WindowRequest {
    pub weekday: Weekday,
    pub hour: u32,
}

#[derive(Debug, Deserialize)]
pub struct PayoutSettingsRequest {
    pub frequency: PayoutFrequency,
    pub cutoff: WindowRequest,
    pub payout: WindowRequest,
    pub timezone: String,
    #[serde(default)]
    pub bank: Option<BankAccount>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CorrectionRequest {
    #[serde(default)]
    pub note: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/wallet", get(get_summary))
        .route("/v1/wallet/ledger", get(get_ledger))
        .route("/v1/wallet/payout-settings", put(put_payout_settings))
        .route("/v1/wallet/payouts", post(run_payout))
        .route("/v1/wallet/verify", get(verify_balances))
        .route("/v1/ledger/entries/{id}/correction", post(correct_entry))
}

// ============================================================================
// Vendor Handlers
// ============================================================================

pub async fn get_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<WalletSummary>, AppError> {
    claims.require(&[Role::Vendor])?;
    Ok(Json(state.ledger.summary(&claims.vendor_id()).await?))
}

pub async fn get_ledger(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<WalletLedgerEntry>>, AppError> {
    claims.require(&[Role::Vendor])?;
    Ok(Json(state.ledger.entries(&claims.vendor_id(), query.source).await?))
}

pub async fn put_payout_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PayoutSettingsRequest>,
) -> Result<Json<WalletSummary>, AppError> {
    claims.require(&[Role::Vendor])?;
    let schedule = PayoutSchedule::new(
        req.frequency,
        WeeklyWindow::new(req.cutoff.weekday, req.cutoff.hour)?,
        WeeklyWindow::new(req.payout.weekday, req.payout.hour)?,
        &req.timezone,
    )?;

    let vendor_id = claims.vendor_id();
    state
        .ledger
        .set_payout_settings(&vendor_id, PayoutSettings { schedule, bank: req.bank })
        .await?;
    Ok(Json(state.ledger.summary(&vendor_id).await?))
}

/// Pay out the caller's eligible balance now. 204 when there is nothing to pay.
pub async fn run_payout(State(state): State<AppState>, Extension(claims): Extension<Claims>) -> Result<Response, AppError> {
    claims.require(&[Role::Vendor])?;
    let outcome = state.payouts.run_payout(&claims.vendor_id()).await?;
    Ok(match outcome {
        Some(outcome) => {
            let paid = outcome.status == TransferStatus::Succeeded;
            state.metrics.record_payouts(paid as usize, (!paid) as usize);
            Json(outcome).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn verify_balances(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<BalanceCheck>, AppError> {
    claims.require(&[Role::Vendor])?;
    Ok(Json(state.ledger.verify_balances(&claims.vendor_id()).await?))
}

// ============================================================================
// Operator Handlers
// ============================================================================

/// Reverse one entry with an equal and opposite correction.
pub async fn correct_entry(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(entry_id): Path<Uuid>,
    req: Option<Json<CorrectionRequest>>,
) -> Result<(StatusCode, Json<WalletLedgerEntry>), AppError> {
    claims.require(&[Role::Operator])?;
    let Json(req) = req.unwrap_or_default();
    let entry = state
        .ledger
        .append_correction(EntryId(entry_id), claims.actor(), req.note)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
