//! Vendor wallets: an append-only ledger of holds, releases and payouts, the
//! payout calendar that decides when held earnings become payable, and the
//! sweep and batching jobs that move money along.

pub mod ledger;
pub mod memory;
pub mod models;
pub mod repository;
pub mod schedule;
pub mod settlement;
pub mod sweep;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use ledger::{SaleHold, WalletLedger};
pub use memory::InMemoryLedger;
pub use models::{
    Balances, BalanceCheck, EarningsBySource, EarningsSource, LedgerEntryType, NewLedgerEntry,
    PayoutSettings, WalletLedgerEntry, WalletSummary,
};
pub use repository::{AppendGuard, LedgerRepository};
pub use schedule::{PayoutFrequency, PayoutSchedule, WeeklyWindow};
pub use settlement::{PayoutOutcome, PayoutRunReport, PayoutService};
pub use sweep::{PayoutScheduler, SweepReport};
