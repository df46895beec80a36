//! Data layer module
//!
//! Handles all data persistence:
//! - Follower registry
//! - Durable work queues

mod database;
mod models;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
