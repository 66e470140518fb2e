use async_trait::async_trait;
use bazaar_core::{Actor, CoreError};
use bazaar_shared::{Currency, EntryId, EventId, OrderId, PayoutBatchId, VendorId};
use bazaar_wallet::{AppendGuard, LedgerRepository, NewLedgerEntry, PayoutSettings, WalletLedgerEntry};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(FromRow)]
struct LedgerRow {
    id: Uuid,
    vendor_id: String,
    currency: String,
    source: String,
    order_ref: Option<Uuid>,
    event_id: Option<String>,
    amount_minor: i64,
    entry_type: String,
    target_payout_at: Option<DateTime<Utc>>,
    target_payout_key: Option<String>,
    payout_batch_id: Option<Uuid>,
    corrects: Option<Uuid>,
    releases: Option<Uuid>,
    note: Option<String>,
    meta: serde_json::Value,
    created_at: DateTime<Utc>,
    created_by: String,
}

impl TryFrom<LedgerRow> for WalletLedgerEntry {
    type Error = CoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(WalletLedgerEntry {
            id: EntryId(row.id),
            vendor_id: VendorId(row.vendor_id),
            currency: row.currency.parse().map_err(CoreError::storage)?,
            source: row.source.parse()?,
            order_ref: row.order_ref.map(OrderId),
            event_id: row.event_id.map(EventId),
            amount_minor: row.amount_minor,
            entry_type: row.entry_type.parse()?,
            target_payout_at: row.target_payout_at,
            target_payout_key: row.target_payout_key,
            payout_batch_id: row.payout_batch_id.map(PayoutBatchId),
            corrects: row.corrects.map(EntryId),
            releases: row.releases.map(EntryId),
            note: row.note,
            meta: row.meta,
            created_at: row.created_at,
            created_by: row.created_by.parse::<Actor>().map_err(CoreError::Storage)?,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, vendor_id, currency, source, order_ref, event_id, amount_minor, entry_type, \
     target_payout_at, target_payout_key, payout_batch_id, corrects, releases, note, meta, created_at, created_by";

fn rows_to_entries(rows: Vec<LedgerRow>) -> Result<Vec<WalletLedgerEntry>, CoreError> {
    rows.into_iter().map(WalletLedgerEntry::try_from).collect()
}

/// Unique-index hits mean another writer settled the same hold first.
fn write_error(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return CoreError::Conflict(db.message().to_string());
        }
    }
    CoreError::storage(err)
}

/// Wallet ledgers in Postgres. The `vendor_wallets` row is locked with
/// `FOR UPDATE` for the duration of every append, which serializes writers per
/// vendor across processes.
#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_wallet(
        tx: &mut Transaction<'_, Postgres>,
        vendor_id: &VendorId,
    ) -> Result<Option<Currency>, CoreError> {
        sqlx::query("INSERT INTO vendor_wallets (vendor_id) VALUES ($1) ON CONFLICT (vendor_id) DO NOTHING")
            .bind(vendor_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(CoreError::storage)?;

        let (currency,): (Option<String>,) =
            sqlx::query_as("SELECT currency FROM vendor_wallets WHERE vendor_id = $1 FOR UPDATE")
                .bind(vendor_id.as_str())
                .fetch_one(&mut **tx)
                .await
                .map_err(CoreError::storage)?;

        currency
            .map(|c| c.parse::<Currency>().map_err(CoreError::storage))
            .transpose()
    }

    async fn check_guard(tx: &mut Transaction<'_, Postgres>, guard: AppendGuard) -> Result<(), CoreError> {
        let (sql, id, message) = match guard {
            AppendGuard::None => return Ok(()),
            AppendGuard::HoldStillOpen(id) => (
                "SELECT EXISTS (SELECT 1 FROM wallet_ledger_entries \
                 WHERE (releases = $1 AND entry_type = 'release_hold') OR corrects = $1)",
                id.0,
                format!("entry {} is already settled", id),
            ),
            AppendGuard::NotYetCorrected(id) => (
                "SELECT EXISTS (SELECT 1 FROM wallet_ledger_entries \
                 WHERE corrects = $1 OR (id = $1 AND payout_batch_id IS NOT NULL))",
                id.0,
                format!("entry {} is already corrected or batched", id),
            ),
            AppendGuard::BatchUnsettled(batch_id) => (
                "SELECT EXISTS (SELECT 1 FROM wallet_ledger_entries \
                 WHERE payout_batch_id = $1 AND entry_type = 'debit_payout')",
                batch_id.0,
                format!("payout batch {} is already booked", batch_id),
            ),
        };

        let (taken,): (bool,) = sqlx::query_as(sql)
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(CoreError::storage)?;
        if taken {
            return Err(CoreError::Conflict(message));
        }
        Ok(())
    }

    async fn insert_entry(tx: &mut Transaction<'_, Postgres>, entry: &WalletLedgerEntry) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "INSERT INTO wallet_ledger_entries ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            ENTRY_COLUMNS
        ))
        .bind(entry.id.0)
        .bind(entry.vendor_id.as_str())
        .bind(entry.currency.as_str())
        .bind(entry.source.as_str())
        .bind(entry.order_ref.map(|o| o.0))
        .bind(entry.event_id.as_ref().map(|e| e.as_str()))
        .bind(entry.amount_minor)
        .bind(entry.entry_type.as_str())
        .bind(entry.target_payout_at)
        .bind(entry.target_payout_key.as_deref())
        .bind(entry.payout_batch_id.map(|b| b.0))
        .bind(entry.corrects.map(|c| c.0))
        .bind(entry.releases.map(|r| r.0))
        .bind(entry.note.as_deref())
        .bind(&entry.meta)
        .bind(entry.created_at)
        .bind(entry.created_by.to_string())
        .execute(&mut **tx)
        .await
        .map_err(write_error)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn append(
        &self,
        entries: Vec<NewLedgerEntry>,
        guard: AppendGuard,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let Some(first) = entries.first() else {
            return Ok(Vec::new());
        };
        let vendor_id = first.vendor_id.clone();
        if entries.iter().any(|e| e.vendor_id != vendor_id) {
            return Err(CoreError::Invalid("one append may only touch one vendor".into()));
        }

        let mut tx = self.pool.begin().await.map_err(CoreError::storage)?;
        let wallet_currency = Self::lock_wallet(&mut tx, &vendor_id).await?;
        Self::check_guard(&mut tx, guard).await?;

        let expected = wallet_currency.clone().unwrap_or_else(|| first.currency.clone());
        if let Some(bad) = entries.iter().find(|e| e.currency != expected) {
            return Err(CoreError::CurrencyMismatch {
                vendor_id: vendor_id.to_string(),
                expected: expected.to_string(),
                found: bad.currency.to_string(),
            });
        }
        if wallet_currency.is_none() {
            sqlx::query("UPDATE vendor_wallets SET currency = $2 WHERE vendor_id = $1")
                .bind(vendor_id.as_str())
                .bind(expected.as_str())
                .execute(&mut *tx)
                .await
                .map_err(CoreError::storage)?;
        }

        let mut written = Vec::with_capacity(entries.len());
        for new in entries {
            let entry = new.into_entry(EntryId::new(), created_at);
            Self::insert_entry(&mut tx, &entry).await?;
            written.push(entry);
        }

        tx.commit().await.map_err(write_error)?;
        debug!(vendor_id = %vendor_id, count = written.len(), "ledger rows written");
        Ok(written)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<WalletLedgerEntry>, CoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM wallet_ledger_entries WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        row.map(WalletLedgerEntry::try_from).transpose()
    }

    async fn entries_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM wallet_ledger_entries WHERE vendor_id = $1 ORDER BY seq",
            ENTRY_COLUMNS
        ))
        .bind(vendor_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        rows_to_entries(rows)
    }

    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM wallet_ledger_entries h \
             WHERE h.entry_type = 'debit_hold' AND h.corrects IS NULL AND h.target_payout_at <= $1 \
               AND NOT EXISTS (SELECT 1 FROM wallet_ledger_entries r \
                   WHERE (r.releases = h.id AND r.entry_type = 'release_hold') OR r.corrects = h.id) \
             ORDER BY h.seq",
            ENTRY_COLUMNS
                .split(", ")
                .map(|c| format!("h.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        rows_to_entries(rows)
    }

    async fn stamp_unbatched_credits(
        &self,
        vendor_id: &VendorId,
        batch_id: PayoutBatchId,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(CoreError::storage)?;

        let locked: Option<(String,)> =
            sqlx::query_as("SELECT vendor_id FROM vendor_wallets WHERE vendor_id = $1 FOR UPDATE")
                .bind(vendor_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(CoreError::storage)?;
        if locked.is_none() {
            return Ok(Vec::new());
        }

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount_minor), 0)::BIGINT FROM wallet_ledger_entries \
             WHERE vendor_id = $1 AND entry_type = 'credit_eligible' AND payout_batch_id IS NULL",
        )
        .bind(vendor_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(CoreError::storage)?;
        if total <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "UPDATE wallet_ledger_entries SET payout_batch_id = $2 \
             WHERE vendor_id = $1 AND entry_type = 'credit_eligible' AND payout_batch_id IS NULL \
             RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(vendor_id.as_str())
        .bind(batch_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(CoreError::storage)?;

        tx.commit().await.map_err(CoreError::storage)?;
        let mut stamped = rows_to_entries(rows)?;
        stamped.sort_by_key(|e| e.created_at);
        Ok(stamped)
    }

    async fn vendor_ids(&self) -> Result<Vec<VendorId>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT vendor_id FROM vendor_wallets ORDER BY vendor_id")
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::storage)?;
        Ok(rows.into_iter().map(|(id,)| VendorId(id)).collect())
    }

    async fn payout_settings(&self, vendor_id: &VendorId) -> Result<Option<PayoutSettings>, CoreError> {
        let row: Option<(Option<Json<serde_json::Value>>,)> =
            sqlx::query_as("SELECT payout_settings FROM vendor_wallets WHERE vendor_id = $1")
                .bind(vendor_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(CoreError::storage)?;

        let Some(Json(raw)) = row.and_then(|(settings,)| settings) else {
            return Ok(None);
        };
        match serde_json::from_value::<PayoutSettings>(raw) {
            Ok(settings) => Ok(Some(settings)),
            Err(e) => {
                warn!(vendor_id = %vendor_id, error = %e, "unreadable payout settings, using defaults");
                Ok(None)
            }
        }
    }

    async fn save_payout_settings(&self, vendor_id: &VendorId, settings: &PayoutSettings) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO vendor_wallets (vendor_id, payout_settings) VALUES ($1, $2) \
             ON CONFLICT (vendor_id) DO UPDATE SET payout_settings = EXCLUDED.payout_settings",
        )
        .bind(vendor_id.as_str())
        .bind(Json(settings))
        .execute(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        Ok(())
    }
}
