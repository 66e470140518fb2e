pub mod clock;
pub mod events;
pub mod identity;
pub mod payout_rail;

pub use clock::{Clock, FixedClock, SystemClock};
pub use events::{EventPublisher, LogEventPublisher};
pub use identity::{Actor, EventRole, ViewerContext};

/// Every failure this core reports. Callers branch on the variant; nothing here
/// is fatal and a failed write leaves prior state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("this item belongs to another vendor (line {line_key})")]
    NotOwner { line_key: String, requested_by: String },

    #[error("line {line_key} cannot move from {from} to {to}")]
    TerminalStateViolation {
        line_key: String,
        from: String,
        to: String,
    },

    #[error("quantity {requested} for line {line_key} is outside 0..={max}")]
    InvalidQuantity {
        line_key: String,
        requested: i64,
        max: u32,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("concurrent update lost: {0}")]
    Conflict(String),

    #[error("wallet for vendor {vendor_id} is in {expected}, entry is in {found}")]
    CurrencyMismatch {
        vendor_id: String,
        expected: String,
        found: String,
    },

    #[error("line key {0} appears more than once in the order")]
    DuplicateLineKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl CoreError {
    /// Stable machine-readable code for API bodies and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotOwner { .. } => "not_owner",
            CoreError::TerminalStateViolation { .. } => "terminal_state_violation",
            CoreError::InvalidQuantity { .. } => "invalid_quantity",
            CoreError::InvalidAmount(_) => "invalid_amount",
            CoreError::Invalid(_) => "invalid",
            CoreError::Conflict(_) => "conflict",
            CoreError::CurrencyMismatch { .. } => "currency_mismatch",
            CoreError::DuplicateLineKey(_) => "duplicate_line_key",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Storage(_) => "storage",
        }
    }

    /// Only optimistic-lock losses are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(CoreError::Conflict("line m-1".into()).is_retryable());
        assert!(!CoreError::NotFound("order".into()).is_retryable());
        assert!(!CoreError::Storage("timeout".into()).is_retryable());
    }

    #[test]
    fn test_not_owner_message_is_actionable() {
        let err = CoreError::NotOwner {
            line_key: "merch-1".into(),
            requested_by: "vendor-y".into(),
        };
        assert_eq!(err.kind(), "not_owner");
        assert!(err.to_string().starts_with("this item belongs to another vendor"));
    }
}
