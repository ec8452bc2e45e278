//! Seams the dispatch engine is built against.

pub mod store;
pub mod transport;

pub use store::{AutomationStore, DueStepQuery, LeadUpdate};
pub use transport::DeliveryTransport;
