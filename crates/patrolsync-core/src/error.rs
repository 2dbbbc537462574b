//! Error types for PatrolSync
//!
//! Verification, geofence and duplicate-visit failures are surfaced
//! synchronously at scan time and never queued. Transient sync failures stay
//! in the queue and retry; server rejections are terminal per entry. A queue
//! persist failure is fatal to the enqueue — an event is never reported as
//! recorded unless it was durably queued.

use std::time::Duration;

use thiserror::Error;

use crate::types::{CheckpointId, EventId};

/// Token verification failures
///
/// Expiry takes precedence over the usage limit: an expired token reports
/// `Expired` even when its usage limit is also exhausted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerificationError {
    /// Token exists but is not currently usable (inactive, not yet valid,
    /// or presented via a method the checkpoint does not accept)
    #[error("Invalid code: {0}")]
    InvalidCode(String),

    /// Token's validity window has passed
    #[error("Token expired: {0}")]
    Expired(String),

    /// Token's usage limit has been reached
    #[error("Usage limit reached for token: {0}")]
    UsageLimitReached(String),

    /// No token matches the scanned code or NFC tag
    #[error("Token not found: {0}")]
    NotFound(String),

    /// The external registry could not be reached
    #[error("Registry error: {0}")]
    Registry(String),
}

/// Geofence containment failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeofenceError {
    /// Reported position is outside the checkpoint radius
    #[error("Out of range: {distance_meters:.1}m from checkpoint (radius {radius_meters:.1}m)")]
    OutOfRange {
        distance_meters: f64,
        radius_meters: f64,
    },
}

/// A repeat checkpoint visit inside the dedup window
///
/// Surfaced as a non-fatal notice, not an error condition: the scan was
/// genuine, it just must not inflate checkpoint-completion counters.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Duplicate visit: {actor_id} already visited {checkpoint_id} {seconds_since}s ago")]
pub struct DuplicateVisit {
    pub actor_id: String,
    pub checkpoint_id: CheckpointId,
    /// Seconds since the prior visit
    pub seconds_since: i64,
}

/// Sync delivery failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Connectivity loss or transport-level failure; retried
    #[error("Network error: {0}")]
    Network(String),

    /// The ingestion request did not complete in time; retried
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server refused the event; terminal for the entry, never
    /// retried automatically
    #[error("Server rejected event: {0}")]
    ServerRejected(String),

    /// The server already holds an event with this idempotency key
    #[error("Server reported duplicate delivery: {0}")]
    ServerDuplicate(String),
}

impl SyncError {
    /// Whether a retry can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

/// Offline queue failures
#[derive(Error, Debug)]
pub enum QueueError {
    /// The entry could not be durably written. Fatal to the operation:
    /// the caller must not report the event as recorded.
    #[error("Queue persist failed: {0}")]
    PersistFailed(String),

    /// No entry with the given id exists
    #[error("Queue entry not found: {0}")]
    EntryNotFound(EventId),

    /// Entry bytes could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The requested status change is not a legal state-machine transition
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: EventId,
        from: crate::types::SyncStatus,
        to: crate::types::SyncStatus,
    },
}

impl From<redb::DatabaseError> for QueueError {
    fn from(e: redb::DatabaseError) -> Self {
        QueueError::PersistFailed(e.to_string())
    }
}

impl From<redb::TransactionError> for QueueError {
    fn from(e: redb::TransactionError) -> Self {
        QueueError::PersistFailed(e.to_string())
    }
}

impl From<redb::TableError> for QueueError {
    fn from(e: redb::TableError) -> Self {
        QueueError::PersistFailed(e.to_string())
    }
}

impl From<redb::StorageError> for QueueError {
    fn from(e: redb::StorageError) -> Self {
        QueueError::PersistFailed(e.to_string())
    }
}

impl From<redb::CommitError> for QueueError {
    fn from(e: redb::CommitError) -> Self {
        QueueError::PersistFailed(e.to_string())
    }
}

/// Realtime channel failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    /// Could not establish a connection
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The connection closed underneath us
    #[error("Connection closed")]
    ConnectionClosed,

    /// Frame could not be encoded/decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reconnect attempts exhausted; caller must explicitly reconnect
    #[error("Connection lost after {attempts} reconnect attempts")]
    Lost { attempts: u32 },

    /// A message cannot be published from unsynced local state
    #[error("Event {0} has no server id; only server-confirmed events are republished")]
    Unconfirmed(EventId),
}

/// Main error type for PatrolSync operations
#[derive(Error, Debug)]
pub enum PatrolError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Geofence(#[from] GeofenceError),

    #[error(transparent)]
    DuplicateVisit(#[from] DuplicateVisit),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    /// Checkpoint referenced by a token or scan does not exist
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(CheckpointId),

    /// Location fix did not arrive within the acquisition timeout
    #[error("Location acquisition timed out after {0:?}")]
    LocationTimeout(Duration),

    /// Location provider failed outright
    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using PatrolError
pub type PatrolResult<T> = Result<T, PatrolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VerificationError::Expired("CHK-001".to_string());
        assert_eq!(format!("{}", err), "Token expired: CHK-001");

        let err = GeofenceError::OutOfRange {
            distance_meters: 72.4,
            radius_meters: 50.0,
        };
        assert_eq!(
            format!("{}", err),
            "Out of range: 72.4m from checkpoint (radius 50.0m)"
        );
    }

    #[test]
    fn test_sync_error_transience() {
        assert!(SyncError::Network("connection reset".into()).is_transient());
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(!SyncError::ServerRejected("expired token".into()).is_transient());
        assert!(!SyncError::ServerDuplicate("abc".into()).is_transient());
    }

    #[test]
    fn test_queue_error_from_redb() {
        // All redb failure modes collapse into PersistFailed: the caller
        // only needs to know the write did not land.
        let err: QueueError = redb::TableError::TableDoesNotExist("queue".into()).into();
        assert!(matches!(err, QueueError::PersistFailed(_)));
    }

    #[test]
    fn test_patrol_error_from_verification() {
        let err: PatrolError = VerificationError::NotFound("XYZ".into()).into();
        assert!(matches!(err, PatrolError::Verification(_)));
    }

    #[test]
    fn test_duplicate_visit_display() {
        let err = DuplicateVisit {
            actor_id: "guard-7".into(),
            checkpoint_id: CheckpointId::new("cp-3"),
            seconds_since: 120,
        };
        assert_eq!(
            format!("{}", err),
            "Duplicate visit: guard-7 already visited cp-3 120s ago"
        );
    }
}
