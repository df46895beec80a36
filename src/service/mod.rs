//! Service layer
//!
//! Orchestrates database and federation operations for the HTTP layer
//! and the publishing side.

mod federation;

pub use federation::Federation;
