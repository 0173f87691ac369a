//! Core engines: order placement, reconciliation, reaction dispatch, and
//! exchange sync.

pub mod orders;
pub mod reactions;
pub mod reconcile;
pub mod sync;
