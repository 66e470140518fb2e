use bazaar_core::{Actor, Clock, CoreError, CoreResult, EventPublisher};
use bazaar_shared::models::events::{DomainEvent, HoldReleasedEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::ledger::WalletLedger;
use crate::models::{LedgerEntryType, NewLedgerEntry, WalletLedgerEntry};
use crate::repository::AppendGuard;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub released: usize,
    /// Holds another sweep released first.
    pub skipped: usize,
    pub failed: usize,
}

/// Promotes on-hold earnings to eligible once their payout date arrives.
pub struct PayoutScheduler {
    ledger: Arc<WalletLedger>,
    publisher: Arc<dyn EventPublisher>,
}

impl PayoutScheduler {
    pub fn new(ledger: Arc<WalletLedger>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { ledger, publisher }
    }

    /// Release every open hold due at or before `now`. Safe to run repeatedly
    /// and concurrently: a hold is released at most once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let due = self.ledger.repository().due_holds(now).await?;
        let mut report = SweepReport {
            scanned: due.len(),
            ..Default::default()
        };

        for hold in due {
            match self.release(&hold).await {
                Ok(()) => report.released += 1,
                Err(CoreError::Conflict(reason)) => {
                    debug!(hold_id = %hold.id, %reason, "hold already released");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(hold_id = %hold.id, vendor_id = %hold.vendor_id, error = %e, "failed to release hold");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "payout sweep finished"
            );
        }
        Ok(report)
    }

    async fn release(&self, hold: &WalletLedgerEntry) -> CoreResult<()> {
        let amount = -hold.amount_minor;
        let pair = [LedgerEntryType::ReleaseHold, LedgerEntryType::CreditEligible].map(|entry_type| {
            let mut entry = NewLedgerEntry::new(
                hold.vendor_id.clone(),
                hold.currency.clone(),
                hold.source,
                entry_type,
                amount,
                Actor::System,
            );
            entry.order_ref = hold.order_ref;
            entry.event_id = hold.event_id.clone();
            entry.releases = Some(hold.id);
            entry.target_payout_at = hold.target_payout_at;
            entry.target_payout_key = hold.target_payout_key.clone();
            entry
        });

        self.ledger
            .append_guarded(pair.to_vec(), AppendGuard::HoldStillOpen(hold.id))
            .await?;

        let event = DomainEvent::HoldReleased(HoldReleasedEvent {
            vendor_id: hold.vendor_id.clone(),
            hold_entry_id: hold.id,
            amount_minor: amount,
            timestamp: self.ledger.clock().now().timestamp(),
        });
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(hold_id = %hold.id, error = %e, "failed to publish hold release");
        }
        Ok(())
    }
}
