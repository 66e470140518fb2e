pub mod ids;
pub mod money;
pub mod status;
pub mod pii;
pub mod models;

pub use ids::{EntryId, EventId, LineKey, MerchItemId, OrderId, PayoutBatchId, TicketTypeId, VendorId};
pub use money::{Currency, MinorUnits};
pub use status::{FulfillmentStatus, OrderStatus, VendorLineStatus};
