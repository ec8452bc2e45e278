//! # Dripline Core
//!
//! Shared building blocks for the automation workspace: the error type,
//! configuration, domain records and the two seams the dispatch engine
//! depends on (the store and the delivery transport).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::DriplineConfig;
pub use error::{DriplineError, Result};
pub use types::*;
