use bazaar_core::{Actor, Clock, CoreError, CoreResult};
use bazaar_shared::{Currency, EntryId, EventId, MinorUnits, OrderId, VendorId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{
    derive_balances, earnings_by_source, BalanceCheck, Balances, BankSummary, EarningsSource,
    LedgerEntryType, NewLedgerEntry, PayoutInfo, PayoutSettings, WalletLedgerEntry, WalletSummary,
};
use crate::repository::{AppendGuard, LedgerRepository};
use crate::schedule::PayoutSchedule;

/// Proceeds of one sale to put on hold for a vendor.
#[derive(Debug, Clone)]
pub struct SaleHold {
    pub vendor_id: VendorId,
    pub currency: Currency,
    pub source: EarningsSource,
    pub order_ref: Option<OrderId>,
    pub event_id: Option<EventId>,
    /// Positive amount earned; stored as a negative `debit_hold`.
    pub amount_minor: MinorUnits,
    pub note: Option<String>,
}

/// Append-only wallet ledger with a per-vendor balance cache.
pub struct WalletLedger {
    repo: Arc<dyn LedgerRepository>,
    clock: Arc<dyn Clock>,
    default_schedule: PayoutSchedule,
    cache: RwLock<HashMap<VendorId, Balances>>,
}

impl WalletLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>, clock: Arc<dyn Clock>, default_schedule: PayoutSchedule) -> Self {
        Self {
            repo,
            clock,
            default_schedule,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn LedgerRepository> {
        &self.repo
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn append_entry(&self, entry: NewLedgerEntry) -> CoreResult<WalletLedgerEntry> {
        let mut written = self.append_guarded(vec![entry], AppendGuard::None).await?;
        written
            .pop()
            .ok_or_else(|| CoreError::Storage("append returned no entry".into()))
    }

    /// Append several entries for one vendor atomically, subject to `guard`.
    pub async fn append_guarded(
        &self,
        entries: Vec<NewLedgerEntry>,
        guard: AppendGuard,
    ) -> CoreResult<Vec<WalletLedgerEntry>> {
        let Some(vendor_id) = entries.first().map(|e| e.vendor_id.clone()) else {
            return Ok(Vec::new());
        };
        for entry in &entries {
            entry.validate()?;
        }

        let written = self.repo.append(entries, guard, self.clock.now()).await?;
        self.invalidate(&vendor_id).await;

        for entry in &written {
            info!(
                vendor_id = %entry.vendor_id,
                entry_id = %entry.id,
                entry_type = %entry.entry_type,
                amount_minor = entry.amount_minor,
                "ledger entry appended"
            );
        }
        Ok(written)
    }

    /// Offset an existing entry with a net-new one of the same type and
    /// opposite sign. A hold that was already released, or any entry that was
    /// already corrected or paid out, fails `Conflict`.
    pub async fn append_correction(
        &self,
        entry_id: EntryId,
        created_by: Actor,
        note: Option<String>,
    ) -> CoreResult<WalletLedgerEntry> {
        let original = self
            .repo
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("ledger entry {}", entry_id)))?;

        if original.corrects.is_some() {
            return Err(CoreError::Invalid(format!(
                "entry {} is itself a correction",
                entry_id
            )));
        }
        if original.payout_batch_id.is_some() {
            return Err(CoreError::Conflict(format!(
                "entry {} is already part of a payout batch",
                entry_id
            )));
        }

        let guard = match original.entry_type {
            LedgerEntryType::DebitHold => AppendGuard::HoldStillOpen(entry_id),
            _ => AppendGuard::NotYetCorrected(entry_id),
        };

        let mut correction = NewLedgerEntry::new(
            original.vendor_id.clone(),
            original.currency.clone(),
            original.source,
            original.entry_type,
            -original.amount_minor,
            created_by,
        );
        correction.order_ref = original.order_ref;
        correction.event_id = original.event_id.clone();
        correction.corrects = Some(entry_id);
        correction.note = note;

        let mut written = self.append_guarded(vec![correction], guard).await.map_err(|e| {
            if let CoreError::Conflict(_) = e {
                warn!(%entry_id, "correction rejected, entry already settled");
            }
            e
        })?;
        written
            .pop()
            .ok_or_else(|| CoreError::Storage("append returned no entry".into()))
    }

    /// Withhold a sale's proceeds until the vendor's schedule releases them.
    pub async fn hold_for_sale(&self, sale: SaleHold, created_by: Actor) -> CoreResult<WalletLedgerEntry> {
        if sale.amount_minor <= 0 {
            return Err(CoreError::InvalidAmount(format!(
                "sale amount must be positive, got {}",
                sale.amount_minor
            )));
        }
        let settings = self.payout_settings(&sale.vendor_id).await?;
        let (target_at, target_key) = settings.schedule.hold_target(self.clock.now());

        let mut hold = NewLedgerEntry::new(
            sale.vendor_id,
            sale.currency,
            sale.source,
            LedgerEntryType::DebitHold,
            -sale.amount_minor,
            created_by,
        );
        hold.order_ref = sale.order_ref;
        hold.event_id = sale.event_id;
        hold.target_payout_at = Some(target_at);
        hold.target_payout_key = Some(target_key);
        hold.note = sale.note;

        self.append_entry(hold).await
    }

    pub async fn entries(
        &self,
        vendor_id: &VendorId,
        source: Option<EarningsSource>,
    ) -> CoreResult<Vec<WalletLedgerEntry>> {
        let entries = self.repo.entries_for_vendor(vendor_id).await?;
        Ok(match source {
            Some(source) => entries.into_iter().filter(|e| e.source == source).collect(),
            None => entries,
        })
    }

    /// Currency fixed by the vendor's first entry, if any.
    pub async fn wallet_currency(&self, vendor_id: &VendorId) -> CoreResult<Option<Currency>> {
        let entries = self.repo.entries_for_vendor(vendor_id).await?;
        Ok(entries.first().map(|e| e.currency.clone()))
    }

    /// Cached balances; recomputed from raw entries on a miss.
    pub async fn balances(&self, vendor_id: &VendorId) -> CoreResult<Balances> {
        if let Some(cached) = self.cache.read().await.get(vendor_id) {
            return Ok(*cached);
        }
        // Recompute under the write lock so a concurrent invalidate cannot
        // be overtaken by a stale insert.
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.get(vendor_id) {
            return Ok(*cached);
        }
        let entries = self.repo.entries_for_vendor(vendor_id).await?;
        let balances = derive_balances(&entries, None);
        cache.insert(vendor_id.clone(), balances);
        Ok(balances)
    }

    pub async fn invalidate(&self, vendor_id: &VendorId) {
        self.cache.write().await.remove(vendor_id);
    }

    pub async fn verify_balances(&self, vendor_id: &VendorId) -> CoreResult<BalanceCheck> {
        let cached = self.balances(vendor_id).await?;
        let entries = self.repo.entries_for_vendor(vendor_id).await?;
        let recomputed = derive_balances(&entries, None);
        let consistent = cached == recomputed;
        if !consistent {
            warn!(%vendor_id, ?cached, ?recomputed, "wallet cache drifted from ledger");
        }
        Ok(BalanceCheck {
            cached,
            recomputed,
            consistent,
        })
    }

    pub async fn payout_settings(&self, vendor_id: &VendorId) -> CoreResult<PayoutSettings> {
        Ok(self
            .repo
            .payout_settings(vendor_id)
            .await?
            .unwrap_or_else(|| PayoutSettings {
                schedule: self.default_schedule.clone(),
                bank: None,
            }))
    }

    pub async fn set_payout_settings(&self, vendor_id: &VendorId, settings: PayoutSettings) -> CoreResult<()> {
        self.repo.save_payout_settings(vendor_id, &settings).await?;
        info!(%vendor_id, timezone = settings.schedule.timezone.name(), "payout settings updated");
        Ok(())
    }

    pub async fn summary(&self, vendor_id: &VendorId) -> CoreResult<WalletSummary> {
        let balances = self.balances(vendor_id).await?;
        let entries = self.repo.entries_for_vendor(vendor_id).await?;
        let settings = self.payout_settings(vendor_id).await?;

        let last_payout_at = entries
            .iter()
            .filter(|e| e.is_settled_payout())
            .map(|e| e.created_at)
            .max();
        let next_payout_at = settings
            .schedule
            .next_payout_at(last_payout_at, self.clock.now());

        Ok(WalletSummary {
            vendor_id: vendor_id.clone(),
            currency: entries.first().map(|e| e.currency.clone()),
            eligible_balance_minor: balances.eligible_balance_minor,
            on_hold_minor: balances.on_hold_minor,
            earnings_by_source: earnings_by_source(&entries),
            payout: PayoutInfo {
                bank: settings.bank.as_ref().map(BankSummary::from),
                schedule: settings.schedule,
                next_payout_at,
                last_payout_at,
            },
        })
    }
}
