//! Top-level coordination
//!
//! The coordinator turns a manifest into a single settled outcome and
//! exposes the ledger to diagnostic consumers.

pub mod coordinator;
pub mod types;

pub use coordinator::*;
pub use types::*;
