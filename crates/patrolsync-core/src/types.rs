//! Core types for PatrolSync

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Unique identifier for a field event
///
/// Uses ULID for time-ordered unique identifiers that sort lexicographically.
/// The offline queue uses the string form as its storage key, so iterating
/// the queue in key order yields events in capture order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl EventId {
    /// Create a new EventId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the underlying ULID
    pub fn as_ulid(&self) -> &Ulid {
        &self.0
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        let ulid = Ulid::from_string(s)?;
        Ok(Self(ulid))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt_{}", self.0)
    }
}

/// Client-generated idempotency key for server-side de-duplication
///
/// Generated exactly once when a field event is recorded and never
/// regenerated on retry. The ingestion endpoint treats this as the sole
/// dedup key: two deliveries of the same key resolve to one stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub Uuid);

impl IdempotencyKey {
    /// Generate a fresh random key
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IdempotencyKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coordinate on the reference sphere
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A device-reported position with its accuracy estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapturedLocation {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Horizontal accuracy radius in meters, as reported by the device
    pub accuracy_meters: f64,
}

impl CapturedLocation {
    pub fn new(lat: f64, lon: f64, accuracy_meters: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_meters,
        }
    }

    /// The bare coordinate, without the accuracy estimate
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Kind of verification token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Fixed code printed/programmed once
    Static,
    /// Code that rotates on a schedule
    Rotating,
    /// Token bound to a physical checkpoint
    Checkpoint,
}

/// Method used to capture a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMethod {
    Qr,
    Nfc,
    Manual,
}

impl std::fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMethod::Qr => write!(f, "qr"),
            ScanMethod::Nfc => write!(f, "nfc"),
            ScanMethod::Manual => write!(f, "manual"),
        }
    }
}

/// A token registered for presence verification
///
/// Owned by the external token registry; the core only reads it. Invariants:
/// `usage_count <= usage_limit` whenever a limit is set, and a token whose
/// `valid_until_ms` is in the past is never valid regardless of `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationToken {
    /// Opaque code carried by the QR payload or typed manually
    pub code: String,
    /// NFC tag identifier, for tokens also reachable by tag scan
    pub nfc_tag_id: Option<String>,
    pub kind: TokenKind,
    /// Unix timestamp (milliseconds) from which the token is valid
    pub valid_from_ms: i64,
    /// Unix timestamp (milliseconds) after which the token is expired.
    /// Checkpoint tokens are permanent unless this is explicitly set.
    pub valid_until_ms: Option<i64>,
    /// Maximum number of accepted uses, if limited
    pub usage_limit: Option<u32>,
    /// Accepted uses so far
    pub usage_count: u32,
    pub active: bool,
    /// Checkpoint this token is bound to, for checkpoint-kind tokens
    pub checkpoint_id: Option<CheckpointId>,
}

impl VerificationToken {
    /// Whether the token is inside its validity window at `now_ms`.
    ///
    /// Checkpoint tokens with no `valid_until_ms` are always time-valid
    /// once `valid_from_ms` has passed.
    pub fn time_valid(&self, now_ms: i64) -> bool {
        if now_ms < self.valid_from_ms {
            return false;
        }
        match self.valid_until_ms {
            Some(until) => now_ms <= until,
            None => true,
        }
    }

    /// Whether the token has passed its `valid_until_ms`
    pub fn expired(&self, now_ms: i64) -> bool {
        matches!(self.valid_until_ms, Some(until) if now_ms > until)
    }

    /// Whether the usage limit has been reached
    pub fn usage_exhausted(&self) -> bool {
        matches!(self.usage_limit, Some(limit) if self.usage_count >= limit)
    }
}

/// Identifier for a checkpoint definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A physical location guards must visit, identified by a token and a geofence
///
/// Owned by the external registry; read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDefinition {
    pub id: CheckpointId,
    pub site_id: String,
    pub center: GeoPoint,
    pub radius_meters: f64,
    /// Capture methods accepted at this checkpoint
    pub allowed_methods: Vec<ScanMethod>,
}

impl CheckpointDefinition {
    /// Whether the given capture method is accepted at this checkpoint
    pub fn allows(&self, method: ScanMethod) -> bool {
        self.allowed_methods.contains(&method)
    }
}

/// Kind of field event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckIn,
    CheckOut,
    CheckpointVisit,
    Incident,
    BackupRequest,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::CheckIn => write!(f, "check_in"),
            EventKind::CheckOut => write!(f, "check_out"),
            EventKind::CheckpointVisit => write!(f, "checkpoint_visit"),
            EventKind::Incident => write!(f, "incident"),
            EventKind::BackupRequest => write!(f, "backup_request"),
        }
    }
}

/// Token code and method that verified a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub code: String,
    pub method: ScanMethod,
}

/// Information about the capturing device, attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
    pub app_version: String,
}

/// Delivery state of a field event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting in the queue for a drain
    Pending,
    /// A drain is currently delivering this entry
    Syncing,
    /// Delivered and confirmed by the server (terminal)
    Synced,
    /// Last delivery failed; retryable until the attempt ceiling
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Canonical record of a guard action
///
/// `captured_at_ms` and `idempotency_key` are fixed when the event is
/// recorded and never change afterwards; sync retries only touch the
/// `sync_*`, `last_error` and `server_id` fields, and only through the
/// offline queue's API once the event is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEvent {
    pub id: EventId,
    pub idempotency_key: IdempotencyKey,
    pub kind: EventKind,
    pub actor_id: String,
    /// Token verification backing the event, absent for incident reports
    pub verification: Option<VerificationRecord>,
    pub captured_location: CapturedLocation,
    /// Client clock at capture time (unix milliseconds). Distinct from the
    /// server receipt time; establishes event ordering independent of when
    /// sync eventually succeeds.
    pub captured_at_ms: i64,
    /// Checkpoint this event refers to (explicit, or nearest for incidents)
    pub checkpoint_id: Option<CheckpointId>,
    /// Free-form narrative for incidents / backup requests
    pub notes: Option<String>,
    pub device_info: DeviceInfo,
    pub sync_status: SyncStatus,
    pub sync_attempts: u32,
    pub last_error: Option<String>,
    /// Server-assigned id, set once synced
    pub server_id: Option<String>,
}

/// A queued field event plus its retry bookkeeping
///
/// Created when the recorder emits an event; mutated only by the sync
/// engine through the queue's API; leaves the active set only on `synced`,
/// and is retained under `failed` for operator inspection and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub event: FieldEvent,
    /// Unix timestamp (milliseconds) when the entry was queued
    pub enqueued_at_ms: i64,
    /// Earliest time a failed entry becomes eligible for another drain
    pub next_retry_at_ms: Option<i64>,
}

/// Queue counts by status, for operator views
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    /// Capture time of the oldest entry still pending, if any
    pub oldest_pending_ms: Option<i64>,
}

impl QueueStats {
    /// Total number of entries the queue knows about
    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.synced + self.failed
    }
}

/// Current unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_display() {
        let id = EventId::new();
        assert!(id.to_string().starts_with("evt_"));
    }

    #[test]
    fn test_event_id_roundtrip() {
        let id = EventId::new();
        let parsed = EventId::from_string(&id.0.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_idempotency_keys_are_unique() {
        let a = IdempotencyKey::new();
        let b = IdempotencyKey::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_time_validity() {
        let token = VerificationToken {
            code: "CHK-001".into(),
            nfc_tag_id: None,
            kind: TokenKind::Checkpoint,
            valid_from_ms: 1_000,
            valid_until_ms: None,
            usage_limit: None,
            usage_count: 0,
            active: true,
            checkpoint_id: None,
        };

        // Permanent checkpoint token: valid forever once valid_from passes
        assert!(!token.time_valid(999));
        assert!(token.time_valid(1_000));
        assert!(token.time_valid(i64::MAX));
        assert!(!token.expired(i64::MAX));
    }

    #[test]
    fn test_token_expiry_is_inclusive_of_valid_until() {
        let token = VerificationToken {
            code: "ROT-001".into(),
            nfc_tag_id: None,
            kind: TokenKind::Rotating,
            valid_from_ms: 0,
            valid_until_ms: Some(5_000),
            usage_limit: None,
            usage_count: 0,
            active: true,
            checkpoint_id: None,
        };

        assert!(token.time_valid(5_000));
        assert!(!token.time_valid(5_001));
        assert!(token.expired(5_001));
    }

    #[test]
    fn test_token_usage_exhaustion() {
        let mut token = VerificationToken {
            code: "STA-001".into(),
            nfc_tag_id: None,
            kind: TokenKind::Static,
            valid_from_ms: 0,
            valid_until_ms: None,
            usage_limit: Some(2),
            usage_count: 1,
            active: true,
            checkpoint_id: None,
        };

        assert!(!token.usage_exhausted());
        token.usage_count = 2;
        assert!(token.usage_exhausted());
    }

    #[test]
    fn test_checkpoint_allows_method() {
        let checkpoint = CheckpointDefinition {
            id: CheckpointId::new("cp-1"),
            site_id: "site-1".into(),
            center: GeoPoint::new(0.0, 0.0),
            radius_meters: 50.0,
            allowed_methods: vec![ScanMethod::Qr, ScanMethod::Nfc],
        };

        assert!(checkpoint.allows(ScanMethod::Qr));
        assert!(!checkpoint.allows(ScanMethod::Manual));
    }

    #[test]
    fn test_sync_status_serde_names() {
        let json = serde_json::to_string(&SyncStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
        let json = serde_json::to_string(&EventKind::CheckpointVisit).unwrap();
        assert_eq!(json, "\"checkpoint_visit\"");
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            pending: 2,
            syncing: 1,
            synced: 5,
            failed: 3,
            oldest_pending_ms: Some(42),
        };
        assert_eq!(stats.total(), 11);
    }
}
