use async_trait::async_trait;
use bazaar_shared::pii::Masked;
use bazaar_shared::{EntryId, MinorUnits, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Succeeded,
    Failed,
}

/// Where a vendor's money goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankAccount {
    pub bank_name: String,
    pub account_name: String,
    pub account_number: Masked<String>,
}

/// One batch handed to the bank rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub batch_id: PayoutBatchId,
    pub vendor_id: VendorId,
    pub amount_minor: MinorUnits,
    pub currency: String,
    pub bank: Option<BankAccount>,
    pub entry_ids: Vec<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub batch_id: PayoutBatchId,
    pub reference: Option<String>,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PayoutRail: Send + Sync {
    /// Move the batch amount to the vendor's bank account. A declined transfer
    /// comes back as `TransferStatus::Failed`; `Err` means the rail itself broke.
    ///
    /// `batch_id` is the idempotency key: sending a batch again must return
    /// the original receipt without moving money twice.
    async fn transfer(
        &self,
        instruction: &PayoutInstruction,
    ) -> Result<PayoutReceipt, Box<dyn std::error::Error + Send + Sync>>;
}

/// Rail used in development and tests. Declines when there is no bank account
/// on file or when built with [`MockPayoutRail::declining`].
#[derive(Debug, Default, Clone)]
pub struct MockPayoutRail {
    decline_all: bool,
    receipts: Arc<Mutex<HashMap<PayoutBatchId, PayoutReceipt>>>,
}

impl MockPayoutRail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declining() -> Self {
        Self {
            decline_all: true,
            ..Self::default()
        }
    }

    /// Batches that actually moved money.
    pub fn transfers(&self) -> usize {
        self.receipts
            .lock()
            .map(|r| r.values().filter(|r| r.status == TransferStatus::Succeeded).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PayoutRail for MockPayoutRail {
    async fn transfer(
        &self,
        instruction: &PayoutInstruction,
    ) -> Result<PayoutReceipt, Box<dyn std::error::Error + Send + Sync>> {
        let mut receipts = self.receipts.lock().map_err(|_| "mock rail state poisoned")?;
        if let Some(receipt) = receipts.get(&instruction.batch_id) {
            tracing::info!("Mock rail replayed batch {}", instruction.batch_id);
            return Ok(receipt.clone());
        }

        let failure_reason = if self.decline_all {
            Some("transfer declined by rail".to_string())
        } else if instruction.bank.is_none() {
            Some("no bank account on file".to_string())
        } else {
            None
        };

        tracing::info!(
            "Mock rail transfer of {} {} for vendor {} (batch {})",
            instruction.amount_minor,
            instruction.currency,
            instruction.vendor_id,
            instruction.batch_id
        );

        let receipt = PayoutReceipt {
            batch_id: instruction.batch_id,
            reference: failure_reason
                .is_none()
                .then(|| format!("mock_tr_{}", instruction.batch_id.0.simple())),
            status: if failure_reason.is_none() {
                TransferStatus::Succeeded
            } else {
                TransferStatus::Failed
            },
            failure_reason,
            processed_at: Utc::now(),
        };
        receipts.insert(instruction.batch_id, receipt.clone());
        Ok(receipt)
    }
}
