use bazaar_core::payout_rail::BankAccount;
use bazaar_core::{Actor, CoreError};
use bazaar_shared::{Currency, EntryId, EventId, MinorUnits, OrderId, PayoutBatchId, VendorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::schedule::PayoutSchedule;

/// Where the earnings came from: event tickets or the vendor's store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EarningsSource {
    Event,
    Store,
}

impl EarningsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningsSource::Event => "event",
            EarningsSource::Store => "store",
        }
    }
}

impl FromStr for EarningsSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(EarningsSource::Event),
            "store" => Ok(EarningsSource::Store),
            other => Err(CoreError::Storage(format!("unknown earnings source {}", other))),
        }
    }
}

/// Which derived balance an entry contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceClass {
    OnHold,
    Eligible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    /// Sale proceeds withheld until the hold period ends.
    DebitHold,
    /// Offsets a `DebitHold` once the sweep releases it.
    ReleaseHold,
    /// Spendable, payable funds.
    CreditEligible,
    /// Funds sent out in a payout batch.
    DebitPayout,
}

impl LedgerEntryType {
    pub fn balance_class(&self) -> BalanceClass {
        match self {
            LedgerEntryType::DebitHold | LedgerEntryType::ReleaseHold => BalanceClass::OnHold,
            LedgerEntryType::CreditEligible | LedgerEntryType::DebitPayout => BalanceClass::Eligible,
        }
    }

    /// Sign an uncorrected entry of this type must carry.
    pub fn natural_sign(&self) -> i64 {
        match self {
            LedgerEntryType::DebitHold | LedgerEntryType::DebitPayout => -1,
            LedgerEntryType::ReleaseHold | LedgerEntryType::CreditEligible => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::DebitHold => "debit_hold",
            LedgerEntryType::ReleaseHold => "release_hold",
            LedgerEntryType::CreditEligible => "credit_eligible",
            LedgerEntryType::DebitPayout => "debit_payout",
        }
    }
}

impl fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit_hold" => Ok(LedgerEntryType::DebitHold),
            "release_hold" => Ok(LedgerEntryType::ReleaseHold),
            "credit_eligible" => Ok(LedgerEntryType::CreditEligible),
            "debit_payout" => Ok(LedgerEntryType::DebitPayout),
            other => Err(CoreError::Storage(format!("unknown ledger entry type {}", other))),
        }
    }
}

/// One immutable row of a vendor's wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletLedgerEntry {
    pub id: EntryId,
    pub vendor_id: VendorId,
    pub currency: Currency,
    pub source: EarningsSource,
    pub order_ref: Option<OrderId>,
    pub event_id: Option<EventId>,
    pub amount_minor: MinorUnits,
    pub entry_type: LedgerEntryType,
    pub target_payout_at: Option<DateTime<Utc>>,
    pub target_payout_key: Option<String>,
    /// Set once, when the entry is picked up by a payout batch.
    pub payout_batch_id: Option<PayoutBatchId>,
    pub corrects: Option<EntryId>,
    pub releases: Option<EntryId>,
    pub note: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: Actor,
}

impl WalletLedgerEntry {
    pub fn balance_class(&self) -> BalanceClass {
        self.entry_type.balance_class()
    }

    /// A `debit_payout` that actually left the platform, as opposed to the
    /// balancing half of a declined transfer.
    pub fn is_settled_payout(&self) -> bool {
        self.entry_type == LedgerEntryType::DebitPayout
            && self.corrects.is_none()
            && self.meta.get("transfer").and_then(|v| v.as_str()) != Some("failed")
    }
}

/// Input to `WalletLedger::append_entry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub vendor_id: VendorId,
    pub currency: Currency,
    pub source: EarningsSource,
    pub order_ref: Option<OrderId>,
    pub event_id: Option<EventId>,
    pub amount_minor: MinorUnits,
    pub entry_type: LedgerEntryType,
    pub target_payout_at: Option<DateTime<Utc>>,
    pub target_payout_key: Option<String>,
    pub payout_batch_id: Option<PayoutBatchId>,
    pub corrects: Option<EntryId>,
    pub releases: Option<EntryId>,
    pub note: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_by: Actor,
}

impl NewLedgerEntry {
    pub fn new(
        vendor_id: VendorId,
        currency: Currency,
        source: EarningsSource,
        entry_type: LedgerEntryType,
        amount_minor: MinorUnits,
        created_by: Actor,
    ) -> Self {
        Self {
            vendor_id,
            currency,
            source,
            order_ref: None,
            event_id: None,
            amount_minor,
            entry_type,
            target_payout_at: None,
            target_payout_key: None,
            payout_batch_id: None,
            corrects: None,
            releases: None,
            note: None,
            meta: serde_json::Value::Null,
            created_by,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.amount_minor == 0 {
            return Err(CoreError::InvalidAmount("ledger entries cannot be zero".into()));
        }
        let sign = self.amount_minor.signum();
        if self.corrects.is_none() && sign != self.entry_type.natural_sign() {
            return Err(CoreError::InvalidAmount(format!(
                "{} entries must be {}, got {}",
                self.entry_type,
                if self.entry_type.natural_sign() > 0 { "positive" } else { "negative" },
                self.amount_minor
            )));
        }
        if self.entry_type == LedgerEntryType::DebitHold
            && self.corrects.is_none()
            && self.target_payout_at.is_none()
        {
            return Err(CoreError::InvalidAmount(
                "a hold needs a target payout instant".into(),
            ));
        }
        Ok(())
    }

    pub fn into_entry(self, id: EntryId, created_at: DateTime<Utc>) -> WalletLedgerEntry {
        WalletLedgerEntry {
            id,
            vendor_id: self.vendor_id,
            currency: self.currency,
            source: self.source,
            order_ref: self.order_ref,
            event_id: self.event_id,
            amount_minor: self.amount_minor,
            entry_type: self.entry_type,
            target_payout_at: self.target_payout_at,
            target_payout_key: self.target_payout_key,
            payout_batch_id: self.payout_batch_id,
            corrects: self.corrects,
            releases: self.releases,
            note: self.note,
            meta: self.meta,
            created_at,
            created_by: self.created_by,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balances {
    /// Sum of `credit_eligible` and `debit_payout` amounts.
    pub eligible_balance_minor: MinorUnits,
    /// Earnings still withheld, as a positive amount: the negated sum of
    /// `debit_hold` and `release_hold` amounts. Holds are stored negative.
    pub on_hold_minor: MinorUnits,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EarningsBySource {
    pub event: Balances,
    pub store: Balances,
}

/// Recompute balances from raw entries. `on_hold_minor` is reported as the
/// positive amount still withheld.
pub fn derive_balances(entries: &[WalletLedgerEntry], source: Option<EarningsSource>) -> Balances {
    let mut eligible: MinorUnits = 0;
    let mut on_hold: MinorUnits = 0;

    for entry in entries
        .iter()
        .filter(|e| source.map_or(true, |s| e.source == s))
    {
        match entry.balance_class() {
            BalanceClass::Eligible => eligible += entry.amount_minor,
            BalanceClass::OnHold => on_hold -= entry.amount_minor,
        }
    }

    Balances {
        eligible_balance_minor: eligible,
        on_hold_minor: on_hold,
    }
}

pub fn earnings_by_source(entries: &[WalletLedgerEntry]) -> EarningsBySource {
    EarningsBySource {
        event: derive_balances(entries, Some(EarningsSource::Event)),
        store: derive_balances(entries, Some(EarningsSource::Store)),
    }
}

/// Per-vendor payout preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutSettings {
    pub schedule: PayoutSchedule,
    pub bank: Option<BankAccount>,
}

/// Bank details as shown back to the vendor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankSummary {
    pub bank_name: String,
    pub account_name: String,
    pub account_number_tail: String,
}

impl From<&BankAccount> for BankSummary {
    fn from(bank: &BankAccount) -> Self {
        Self {
            bank_name: bank.bank_name.clone(),
            account_name: bank.account_name.clone(),
            account_number_tail: bank.account_number.tail(4),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInfo {
    pub schedule: PayoutSchedule,
    pub bank: Option<BankSummary>,
    pub next_payout_at: DateTime<Utc>,
    pub last_payout_at: Option<DateTime<Utc>>,
}

/// Derived, per-vendor view of the wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSummary {
    pub vendor_id: VendorId,
    pub currency: Option<Currency>,
    pub eligible_balance_minor: MinorUnits,
    /// Positive while earnings are withheld, although the underlying
    /// `debit_hold` entries are negative. See [`Balances::on_hold_minor`].
    pub on_hold_minor: MinorUnits,
    pub earnings_by_source: EarningsBySource,
    pub payout: PayoutInfo,
}

/// Result of comparing the cached balances against a fresh recomputation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceCheck {
    pub cached: Balances,
    pub recomputed: Balances,
    pub consistent: bool,
}
