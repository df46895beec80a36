//! Data models
//!
//! Rust structs representing database rows.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Follower
// =============================================================================

/// A remote actor following one of the local accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    /// Local account name
    pub account: String,
    /// Follower actor IRI
    pub follower: String,
    /// Inbox the follower wants deliveries at
    pub inbox: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Queue
// =============================================================================

/// A persisted work item of a named queue
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueItem {
    pub id: String,
    /// Queue name, e.g. "ap"
    pub name: String,
    /// Opaque payload, only the queue handler knows its format
    pub content: Vec<u8>,
    /// Due time in milliseconds since the Unix epoch
    pub schedule_ms: i64,
    /// Number of times the item was rescheduled
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Due time as a timestamp
    pub fn run_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.schedule_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
