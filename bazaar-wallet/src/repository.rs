use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_shared::{EntryId, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};

use crate::models::{NewLedgerEntry, PayoutSettings, WalletLedgerEntry};

/// Precondition checked atomically with an append, inside the vendor's
/// critical section. A failed guard is reported as `CoreError::Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendGuard {
    None,
    /// The hold is neither released nor corrected yet.
    HoldStillOpen(EntryId),
    /// The entry has not been corrected yet and no payout batch has
    /// stamped it.
    NotYetCorrected(EntryId),
    /// No `debit_payout` has been booked for the batch yet.
    BatchUnsettled(PayoutBatchId),
}

/// Storage for wallet ledgers. Implementations serialize appends per vendor
/// and never update an entry except for the write-once payout batch stamp.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Append all `entries` (same vendor) or none. The first entry a vendor
    /// ever gets fixes the wallet currency; later mismatches fail
    /// `CurrencyMismatch`.
    async fn append(
        &self,
        entries: Vec<NewLedgerEntry>,
        guard: AppendGuard,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError>;

    async fn get_entry(&self, id: EntryId) -> Result<Option<WalletLedgerEntry>, CoreError>;

    /// All entries for a vendor in append order.
    async fn entries_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<WalletLedgerEntry>, CoreError>;

    /// Open, uncorrected holds whose target payout instant is `<= now`.
    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<WalletLedgerEntry>, CoreError>;

    /// Stamp every unbatched `credit_eligible` entry of the vendor with
    /// `batch_id` and return them. Stamps nothing when their sum is not positive.
    async fn stamp_unbatched_credits(
        &self,
        vendor_id: &VendorId,
        batch_id: PayoutBatchId,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError>;

    async fn vendor_ids(&self) -> Result<Vec<VendorId>, CoreError>;

    async fn payout_settings(&self, vendor_id: &VendorId) -> Result<Option<PayoutSettings>, CoreError>;

    async fn save_payout_settings(&self, vendor_id: &VendorId, settings: &PayoutSettings) -> Result<(), CoreError>;
}
