//! # Reflex Trader
//!
//! Alert-driven multi-exchange trading core: a fund ledger with atomic
//! budget primitives, an order orchestrator, and an idempotent trade
//! reconciliation engine.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `domain`: Canonical entities and enums shared by every component
//! - `error`: Error taxonomy for core operations and adapters
//! - `store`: SQLite-based persistence for all entities
//! - `ledger`: Atomic budget primitives and trade-fill settlement
//! - `exchange`: Per-venue REST adapters behind one capability trait
//! - `engine`: Order placement, reconciliation, reaction dispatch, sync
//! - `worker`: Work queue, worker pool, and recurring-pass scheduler

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod store;
pub mod worker;

pub use config::Config;
