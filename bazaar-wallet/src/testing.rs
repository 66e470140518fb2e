//! Ledger doubles for tests in this and dependent crates.

use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_shared::{EntryId, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::InMemoryLedger;
use crate::models::{NewLedgerEntry, PayoutSettings, WalletLedgerEntry};
use crate::repository::{AppendGuard, LedgerRepository};

type AppendFilter = Box<dyn Fn(&[NewLedgerEntry]) -> bool + Send + Sync>;

/// In-memory ledger whose next `failures` appends matching `filter` fail with
/// a storage error before anything is written.
pub struct FailingAppends {
    inner: InMemoryLedger,
    filter: AppendFilter,
    failures: AtomicUsize,
}

impl FailingAppends {
    pub fn new(failures: usize, filter: impl Fn(&[NewLedgerEntry]) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: InMemoryLedger::new(),
            filter: Box::new(filter),
            failures: AtomicUsize::new(failures),
        }
    }

    /// Failures still to be injected.
    pub fn remaining(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerRepository for FailingAppends {
    async fn append(
        &self,
        entries: Vec<NewLedgerEntry>,
        guard: AppendGuard,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        if (self.filter)(&entries)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(CoreError::Storage("connection reset".into()));
        }
        self.inner.append(entries, guard, created_at).await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<WalletLedgerEntry>, CoreError> {
        self.inner.get_entry(id).await
    }

    async fn entries_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        self.inner.entries_for_vendor(vendor_id).await
    }

    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        self.inner.due_holds(now).await
    }

    async fn stamp_unbatched_credits(
        &self,
        vendor_id: &VendorId,
        batch_id: PayoutBatchId,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        self.inner.stamp_unbatched_credits(vendor_id, batch_id).await
    }

    async fn vendor_ids(&self) -> Result<Vec<VendorId>, CoreError> {
        self.inner.vendor_ids().await
    }

    async fn payout_settings(&self, vendor_id: &VendorId) -> Result<Option<PayoutSettings>, CoreError> {
        self.inner.payout_settings(vendor_id).await
    }

    async fn save_payout_settings(&self, vendor_id: &VendorId, settings: &PayoutSettings) -> Result<(), CoreError> {
        self.inner.save_payout_settings(vendor_id, settings).await
    }
}
