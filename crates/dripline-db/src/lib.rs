//! # Dripline DB
//!
//! SQLite-backed implementation of [`dripline_core::traits::AutomationStore`].
//! One connection behind a mutex, WAL journal, schema created on open.

mod rows;
mod schema;
pub mod sqlite;

pub use rows::{format_ts, parse_ts};
pub use sqlite::SqliteStore;
