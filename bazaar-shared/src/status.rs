use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order-level state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    PartiallyFulfilled,
    Fulfilled,
    Cancelled,
}

/// Operational state of one vendor's fulfillment line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Unfulfilled,
    Shipped,
    Delivered,
    Fulfilled,
    Cancelled,
}

/// Coarse status shown to viewers who do not own the line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VendorLineStatus {
    Paid,
    Shipped,
    Fulfilled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

// Storage columns hold the same snake_case labels as the wire format.
macro_rules! status_labels {
    ($ty:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

status_labels!(OrderStatus {
    Pending => "pending",
    Paid => "paid",
    PartiallyFulfilled => "partially_fulfilled",
    Fulfilled => "fulfilled",
    Cancelled => "cancelled",
});

status_labels!(FulfillmentStatus {
    Unfulfilled => "unfulfilled",
    Shipped => "shipped",
    Delivered => "delivered",
    Fulfilled => "fulfilled",
    Cancelled => "cancelled",
});

status_labels!(VendorLineStatus {
    Paid => "paid",
    Shipped => "shipped",
    Fulfilled => "fulfilled",
    Cancelled => "cancelled",
});
