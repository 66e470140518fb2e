use bazaar_core::payout_rail::{PayoutInstruction, PayoutRail, TransferStatus};
use bazaar_core::{Actor, Clock, CoreError, CoreResult, EventPublisher};
use bazaar_shared::models::events::{DomainEvent, PayoutSettledEvent};
use bazaar_shared::{EntryId, MinorUnits, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::ledger::WalletLedger;
use crate::models::{EarningsSource, LedgerEntryType, NewLedgerEntry, PayoutSettings, WalletLedgerEntry};
use crate::repository::AppendGuard;

/// What happened to one payout batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub batch_id: PayoutBatchId,
    pub vendor_id: VendorId,
    pub amount_minor: MinorUnits,
    pub entry_ids: Vec<EntryId>,
    pub status: TransferStatus,
    pub reference: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutRunReport {
    pub vendors_checked: usize,
    pub paid: usize,
    pub failed: usize,
    pub not_due: usize,
}

/// Batches eligible earnings and hands them to the payout rail.
pub struct PayoutService {
    ledger: Arc<WalletLedger>,
    rail: Arc<dyn PayoutRail>,
    publisher: Arc<dyn EventPublisher>,
}

impl PayoutService {
    pub fn new(ledger: Arc<WalletLedger>, rail: Arc<dyn PayoutRail>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            ledger,
            rail,
            publisher,
        }
    }

    /// Pay out every unbatched eligible credit of the vendor now.
    ///
    /// Credits are stamped with a fresh batch id first, so a concurrent run
    /// finds nothing left and returns `None`. A declined transfer is balanced
    /// by a failed `debit_payout` plus a re-issued `credit_eligible`, leaving
    /// the eligible balance where it was. Batches an earlier run stamped but
    /// never booked are settled before a new one is opened.
    pub async fn run_payout(&self, vendor_id: &VendorId) -> CoreResult<Option<PayoutOutcome>> {
        let settings = self.ledger.payout_settings(vendor_id).await?;
        self.reconcile(vendor_id, &settings).await?;

        let batch_id = PayoutBatchId::new();
        let stamped = self
            .ledger
            .repository()
            .stamp_unbatched_credits(vendor_id, batch_id)
            .await?;
        if stamped.is_empty() {
            return Ok(None);
        }
        self.settle_batch(vendor_id, &settings, batch_id, &stamped).await.map(Some)
    }

    /// Book every batch whose credits were stamped but that has no
    /// `debit_payout` yet, as left behind when recording an outcome failed.
    /// The rail is asked again under the same batch id and replays its receipt.
    pub async fn reconcile(&self, vendor_id: &VendorId, settings: &PayoutSettings) -> CoreResult<Vec<PayoutOutcome>> {
        let mut outcomes = Vec::new();
        for (batch_id, stamped) in unbooked_batches(&self.ledger.entries(vendor_id, None).await?) {
            warn!(%vendor_id, %batch_id, "settling unbooked payout batch");
            match self.settle_batch(vendor_id, settings, batch_id, &stamped).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    async fn settle_batch(
        &self,
        vendor_id: &VendorId,
        settings: &PayoutSettings,
        batch_id: PayoutBatchId,
        stamped: &[WalletLedgerEntry],
    ) -> CoreResult<PayoutOutcome> {
        let currency = stamped
            .first()
            .map(|e| e.currency.clone())
            .ok_or_else(|| CoreError::Invalid(format!("payout batch {} has no credits", batch_id)))?;

        let by_source = totals_by_source(stamped);
        let amount_minor: MinorUnits = by_source.values().sum();
        let entry_ids: Vec<EntryId> = stamped.iter().map(|e| e.id).collect();

        let instruction = PayoutInstruction {
            batch_id,
            vendor_id: vendor_id.clone(),
            amount_minor,
            currency: currency.to_string(),
            bank: settings.bank.clone(),
            entry_ids: entry_ids.clone(),
        };

        let (status, reference, failure_reason) = match self.rail.transfer(&instruction).await {
            Ok(receipt) => (receipt.status, receipt.reference, receipt.failure_reason),
            Err(e) => {
                error!(%vendor_id, %batch_id, error = %e, "payout rail error");
                (TransferStatus::Failed, None, Some(e.to_string()))
            }
        };

        let now = self.ledger.clock().now();
        let mut entries = Vec::new();
        for (source, total) in &by_source {
            let mut debit = NewLedgerEntry::new(
                vendor_id.clone(),
                currency.clone(),
                *source,
                LedgerEntryType::DebitPayout,
                -total,
                Actor::System,
            );
            debit.payout_batch_id = Some(batch_id);
            match status {
                TransferStatus::Succeeded => {
                    debit.meta = json!({ "transfer": "succeeded", "reference": reference });
                    entries.push(debit);
                }
                TransferStatus::Failed => {
                    debit.meta = json!({ "transfer": "failed", "reason": failure_reason });
                    entries.push(debit);

                    let mut reissue = NewLedgerEntry::new(
                        vendor_id.clone(),
                        currency.clone(),
                        *source,
                        LedgerEntryType::CreditEligible,
                        *total,
                        Actor::System,
                    );
                    // Waits for the next window instead of retrying right away.
                    let next = settings.schedule.next_payout_after(now);
                    reissue.target_payout_at = Some(next);
                    reissue.target_payout_key = Some(settings.schedule.payout_key(next));
                    reissue.meta = json!({ "reissued_from_batch": batch_id });
                    entries.push(reissue);
                }
            }
        }

        let outcome = PayoutOutcome {
            batch_id,
            vendor_id: vendor_id.clone(),
            amount_minor,
            entry_ids,
            status,
            reference,
            failure_reason,
        };

        match self
            .ledger
            .append_guarded(entries, AppendGuard::BatchUnsettled(batch_id))
            .await
        {
            Ok(_) => {}
            Err(CoreError::Conflict(_)) => {
                info!(%vendor_id, %batch_id, "payout batch booked by a concurrent run");
                return Ok(outcome);
            }
            Err(e) => {
                error!(%vendor_id, %batch_id, ?status, error = %e, "failed to record payout outcome");
                return Err(e);
            }
        }

        match status {
            TransferStatus::Succeeded => {
                info!(%vendor_id, %batch_id, amount_minor, "payout settled")
            }
            TransferStatus::Failed => {
                warn!(%vendor_id, %batch_id, amount_minor, reason = ?outcome.failure_reason, "payout declined")
            }
        }

        let event = DomainEvent::PayoutSettled(PayoutSettledEvent {
            vendor_id: vendor_id.clone(),
            batch_id,
            amount_minor,
            succeeded: status == TransferStatus::Succeeded,
            timestamp: now.timestamp(),
        });
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(%batch_id, error = %e, "failed to publish payout event");
        }

        Ok(outcome)
    }

    /// Run a batch for every vendor whose payout window has come around and
    /// who has credits that reached their target date.
    pub async fn run_due_payouts(&self, now: DateTime<Utc>) -> CoreResult<PayoutRunReport> {
        let mut report = PayoutRunReport::default();

        for vendor_id in self.ledger.repository().vendor_ids().await? {
            report.vendors_checked += 1;
            let settings = self.ledger.payout_settings(&vendor_id).await?;
            match self.reconcile(&vendor_id, &settings).await {
                Ok(settled) => {
                    for outcome in settled {
                        match outcome.status {
                            TransferStatus::Succeeded => report.paid += 1,
                            TransferStatus::Failed => report.failed += 1,
                        }
                    }
                }
                Err(e) => {
                    error!(%vendor_id, error = %e, "payout reconciliation failed");
                    report.failed += 1;
                    continue;
                }
            }
            if !self.is_due(&vendor_id, now).await? {
                report.not_due += 1;
                continue;
            }
            match self.run_payout(&vendor_id).await {
                Ok(Some(outcome)) if outcome.status == TransferStatus::Succeeded => report.paid += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.not_due += 1,
                Err(e) => {
                    error!(%vendor_id, error = %e, "payout run failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn is_due(&self, vendor_id: &VendorId, now: DateTime<Utc>) -> CoreResult<bool> {
        let entries = self.ledger.entries(vendor_id, None).await?;
        let has_ripe_credit = entries.iter().any(|e| {
            e.entry_type == LedgerEntryType::CreditEligible
                && e.payout_batch_id.is_none()
                && e.target_payout_at.unwrap_or(e.created_at) <= now
        });
        if !has_ripe_credit {
            return Ok(false);
        }

        let last_payout_at = entries
            .iter()
            .filter(|e| e.is_settled_payout())
            .map(|e| e.created_at)
            .max();
        match last_payout_at {
            Some(last) => {
                let schedule = self.ledger.payout_settings(vendor_id).await?.schedule;
                Ok(schedule.next_payout_at(Some(last), now) <= now)
            }
            None => Ok(true),
        }
    }
}

/// Stamped credits grouped by batch, for batches without a `debit_payout`.
fn unbooked_batches(entries: &[WalletLedgerEntry]) -> BTreeMap<PayoutBatchId, Vec<WalletLedgerEntry>> {
    let booked: HashSet<PayoutBatchId> = entries
        .iter()
        .filter(|e| e.entry_type == LedgerEntryType::DebitPayout)
        .filter_map(|e| e.payout_batch_id)
        .collect();

    let mut batches: BTreeMap<PayoutBatchId, Vec<WalletLedgerEntry>> = BTreeMap::new();
    for entry in entries {
        if entry.entry_type != LedgerEntryType::CreditEligible {
            continue;
        }
        if let Some(batch_id) = entry.payout_batch_id.filter(|b| !booked.contains(b)) {
            batches.entry(batch_id).or_default().push(entry.clone());
        }
    }
    batches
}

fn totals_by_source(entries: &[WalletLedgerEntry]) -> BTreeMap<EarningsSource, MinorUnits> {
    let mut totals = BTreeMap::new();
    for entry in entries {
        *totals.entry(entry.source).or_insert(0) += entry.amount_minor;
    }
    totals.retain(|_, total| *total != 0);
    totals
}
