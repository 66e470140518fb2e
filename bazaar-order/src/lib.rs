pub mod fulfillment;
pub mod manager;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod repository;
pub mod timeline;
pub mod visibility;

#[cfg(test)]
mod testing;

pub use fulfillment::{can_transition, FulfillmentEngine, SetFulfillmentStatus};
pub use manager::OrderStore;
pub use memory::InMemoryOrders;
pub use models::{FulfillmentLine, FulfillmentSeed, LineItem, LineItemKind, Order, OrderHeader};
pub use orchestrator::{CheckoutOrchestrator, ConfirmedOrder, ConfirmedPayment, VendorCredit};
pub use repository::OrderRepository;
pub use timeline::{InMemoryTimeline, Note, Timeline, TimelineEntry, TimelineEvent, TimelineRepository};
pub use visibility::{resolve_view, OrderView, VisibilityReason};
