//! # Dripline Scheduler
//!
//! Enrolls leads into multi-step messaging sequences and advances them with
//! poll-driven dispatch passes.
//!
//! ## Architecture
//! ```text
//! AutomationService::create_run
//!   ├── enrollment: validate request, check templates
//!   ├── lead: find-or-create the lead, merge traits
//!   ├── store: run + ordered steps (scheduled_for = now + delay)
//!   └── DispatchEngine::dispatch_due (scoped to the new run)
//!
//! Dispatcher (tokio interval) / manual trigger
//!   └── DispatchEngine::dispatch_due
//!         ├── select due steps (oldest first, bounded batch)
//!         ├── per step: atomic claim → transport.send → SENT | ERROR
//!         └── status::sync_run_status once per touched run
//! ```

pub mod engine;
pub mod enrollment;
pub mod lead;
pub mod runner;
pub mod service;
pub mod status;

pub use engine::{DispatchEngine, DispatchSettings};
pub use runner::{Dispatcher, spawn_dispatcher};
pub use service::AutomationService;
