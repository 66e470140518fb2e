use async_trait::async_trait;
use bazaar_core::CoreError;
use bazaar_shared::{Currency, EntryId, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::models::{LedgerEntryType, NewLedgerEntry, PayoutSettings, WalletLedgerEntry};
use crate::repository::{AppendGuard, LedgerRepository};

#[derive(Default)]
struct VendorBook {
    currency: Option<Currency>,
    entries: Vec<WalletLedgerEntry>,
    released: HashSet<EntryId>,
    corrected: HashSet<EntryId>,
}

impl VendorBook {
    fn check_guard(&self, guard: AppendGuard) -> Result<(), CoreError> {
        match guard {
            AppendGuard::None => Ok(()),
            AppendGuard::HoldStillOpen(id) => {
                if self.released.contains(&id) || self.corrected.contains(&id) {
                    Err(CoreError::Conflict(format!("hold {} is already settled", id)))
                } else {
                    Ok(())
                }
            }
            AppendGuard::NotYetCorrected(id) => {
                if self.corrected.contains(&id) {
                    Err(CoreError::Conflict(format!("entry {} is already corrected", id)))
                } else if self.entries.iter().any(|e| e.id == id && e.payout_batch_id.is_some()) {
                    Err(CoreError::Conflict(format!("entry {} is already part of a payout batch", id)))
                } else {
                    Ok(())
                }
            }
            AppendGuard::BatchUnsettled(batch_id) => {
                let booked = self.entries.iter().any(|e| {
                    e.entry_type == LedgerEntryType::DebitPayout && e.payout_batch_id == Some(batch_id)
                });
                if booked {
                    Err(CoreError::Conflict(format!("payout batch {} is already booked", batch_id)))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Ledger kept in process memory. One async mutex per vendor: appends for the
/// same vendor queue up, different vendors never wait on each other.
#[derive(Default)]
pub struct InMemoryLedger {
    books: RwLock<HashMap<VendorId, Arc<Mutex<VendorBook>>>>,
    index: RwLock<HashMap<EntryId, VendorId>>,
    settings: RwLock<HashMap<VendorId, PayoutSettings>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn book(&self, vendor_id: &VendorId) -> Arc<Mutex<VendorBook>> {
        if let Some(book) = self.books.read().await.get(vendor_id) {
            return book.clone();
        }
        self.books
            .write()
            .await
            .entry(vendor_id.clone())
            .or_default()
            .clone()
    }

    async fn all_books(&self) -> Vec<Arc<Mutex<VendorBook>>> {
        self.books.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
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
        let book = self.book(&vendor_id).await;
        let mut book = book.lock().await;

        book.check_guard(guard)?;

        let expected = book.currency.clone().unwrap_or_else(|| first.currency.clone());
        if let Some(bad) = entries.iter().find(|e| e.currency != expected) {
            return Err(CoreError::CurrencyMismatch {
                vendor_id: vendor_id.to_string(),
                expected: expected.to_string(),
                found: bad.currency.to_string(),
            });
        }
        if entries.iter().any(|e| e.vendor_id != vendor_id) {
            return Err(CoreError::Invalid(
                "one append may only touch one vendor".into(),
            ));
        }

        book.currency = Some(expected);
        let mut written = Vec::with_capacity(entries.len());
        for new in entries {
            let entry = new.into_entry(EntryId::new(), created_at);
            if let Some(hold) = entry.releases {
                if entry.entry_type == LedgerEntryType::ReleaseHold {
                    book.released.insert(hold);
                }
            }
            if let Some(original) = entry.corrects {
                book.corrected.insert(original);
            }
            book.entries.push(entry.clone());
            written.push(entry);
        }
        drop(book);

        let mut index = self.index.write().await;
        for entry in &written {
            index.insert(entry.id, vendor_id.clone());
        }
        Ok(written)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<WalletLedgerEntry>, CoreError> {
        let Some(vendor_id) = self.index.read().await.get(&id).cloned() else {
            return Ok(None);
        };
        let book = self.book(&vendor_id).await;
        let book = book.lock().await;
        Ok(book.entries.iter().find(|e| e.id == id).cloned())
    }

    async fn entries_for_vendor(&self, vendor_id: &VendorId) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let Some(book) = self.books.read().await.get(vendor_id).cloned() else {
            return Ok(Vec::new());
        };
        let book = book.lock().await;
        Ok(book.entries.clone())
    }

    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let mut due = Vec::new();
        for book in self.all_books().await {
            let book = book.lock().await;
            due.extend(
                book.entries
                    .iter()
                    .filter(|e| e.entry_type == LedgerEntryType::DebitHold && e.corrects.is_none())
                    .filter(|e| e.target_payout_at.is_some_and(|t| t <= now))
                    .filter(|e| !book.released.contains(&e.id) && !book.corrected.contains(&e.id))
                    .cloned(),
            );
        }
        Ok(due)
    }

    async fn stamp_unbatched_credits(
        &self,
        vendor_id: &VendorId,
        batch_id: PayoutBatchId,
    ) -> Result<Vec<WalletLedgerEntry>, CoreError> {
        let Some(book) = self.books.read().await.get(vendor_id).cloned() else {
            return Ok(Vec::new());
        };
        let mut book = book.lock().await;

        let pending = |e: &WalletLedgerEntry| {
            e.entry_type == LedgerEntryType::CreditEligible && e.payout_batch_id.is_none()
        };
        let total: i64 = book.entries.iter().filter(|e| pending(e)).map(|e| e.amount_minor).sum();
        if total <= 0 {
            return Ok(Vec::new());
        }

        let mut stamped = Vec::new();
        for entry in book.entries.iter_mut().filter(|e| pending(e)) {
            entry.payout_batch_id = Some(batch_id);
            stamped.push(entry.clone());
        }
        Ok(stamped)
    }

    async fn vendor_ids(&self) -> Result<Vec<VendorId>, CoreError> {
        Ok(self.books.read().await.keys().cloned().collect())
    }

    async fn payout_settings(&self, vendor_id: &VendorId) -> Result<Option<PayoutSettings>, CoreError> {
        Ok(self.settings.read().await.get(vendor_id).cloned())
    }

    async fn save_payout_settings(&self, vendor_id: &VendorId, settings: &PayoutSettings) -> Result<(), CoreError> {
        self.settings
            .write()
            .await
            .insert(vendor_id.clone(), settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EarningsSource;
    use bazaar_core::Actor;

    fn credit(vendor: &VendorId, amount: i64) -> NewLedgerEntry {
        NewLedgerEntry::new(
            vendor.clone(),
            "PHP".parse().unwrap(),
            EarningsSource::Store,
            LedgerEntryType::CreditEligible,
            amount,
            Actor::System,
        )
    }

    #[tokio::test]
    async fn test_stamped_credit_cannot_be_corrected() {
        let repo = InMemoryLedger::new();
        let vendor = VendorId::new("vendor-x");
        let written = repo.append(vec![credit(&vendor, 5000)], AppendGuard::None, Utc::now()).await.unwrap();
        let original = &written[0];

        repo.stamp_unbatched_credits(&vendor, PayoutBatchId::new()).await.unwrap();

        let mut correction = credit(&vendor, -5000);
        correction.corrects = Some(original.id);
        let err = repo
            .append(vec![correction], AppendGuard::NotYetCorrected(original.id), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(repo.entries_for_vendor(&vendor).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_booked_once() {
        let repo = InMemoryLedger::new();
        let vendor = VendorId::new("vendor-x");
        repo.append(vec![credit(&vendor, 5000)], AppendGuard::None, Utc::now()).await.unwrap();
        let batch_id = PayoutBatchId::new();
        repo.stamp_unbatched_credits(&vendor, batch_id).await.unwrap();

        let debit = || {
            let mut debit = credit(&vendor, -5000);
            debit.entry_type = LedgerEntryType::DebitPayout;
            debit.payout_batch_id = Some(batch_id);
            debit
        };
        repo.append(vec![debit()], AppendGuard::BatchUnsettled(batch_id), Utc::now())
            .await
            .unwrap();
        let err = repo
            .append(vec![debit()], AppendGuard::BatchUnsettled(batch_id), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
