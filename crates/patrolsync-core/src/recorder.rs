//! Canonical field event construction
//!
//! The recorder turns a verified scan plus a location and actor into a
//! `FieldEvent`. The idempotency key and the capture timestamp are read
//! exactly once, here; sync retries never regenerate either. For checkpoint
//! visits a dedup window rejects re-scans of the same (actor, checkpoint)
//! pair so repeated scans cannot inflate checkpoint-completion counters.
//!
//! Once an event is handed to the offline queue the recorder never touches
//! it again; all sync bookkeeping is owned by the queue.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::DuplicateVisit;
use crate::types::{
    now_ms, CapturedLocation, CheckpointId, DeviceInfo, EventId, EventKind, FieldEvent,
    IdempotencyKey, SyncStatus, VerificationRecord,
};

/// Default dedup window for repeat checkpoint visits: 5 minutes
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Tracks recent checkpoint visits per (actor, checkpoint) pair
///
/// A second visit inside the window is a duplicate; the first visit outside
/// it replaces the remembered timestamp. Stale pairs are pruned on insert.
pub struct DedupWindow {
    window_ms: i64,
    recent: Mutex<HashMap<(String, CheckpointId), i64>>,
}

impl DedupWindow {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Register a visit at `now_ms`, rejecting it if the pair was seen
    /// within the window
    pub fn check_and_record(
        &self,
        actor_id: &str,
        checkpoint_id: &CheckpointId,
        now_ms: i64,
    ) -> Result<(), DuplicateVisit> {
        let mut recent = self.recent.lock();

        let key = (actor_id.to_string(), checkpoint_id.clone());
        if let Some(&last) = recent.get(&key) {
            let elapsed = now_ms - last;
            if elapsed < self.window_ms {
                return Err(DuplicateVisit {
                    actor_id: actor_id.to_string(),
                    checkpoint_id: checkpoint_id.clone(),
                    seconds_since: elapsed / 1000,
                });
            }
        }

        recent.insert(key, now_ms);
        recent.retain(|_, &mut last| now_ms - last < self.window_ms);
        Ok(())
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}

/// Inputs for one recording
pub struct RecordRequest {
    pub kind: EventKind,
    pub verification: Option<VerificationRecord>,
    pub location: CapturedLocation,
    pub checkpoint_id: Option<CheckpointId>,
    pub notes: Option<String>,
}

/// Builds canonical, idempotent field events for one actor/device
pub struct EventRecorder {
    actor_id: String,
    device_info: DeviceInfo,
    dedup: DedupWindow,
}

impl EventRecorder {
    pub fn new(actor_id: impl Into<String>, device_info: DeviceInfo) -> Self {
        Self {
            actor_id: actor_id.into(),
            device_info,
            dedup: DedupWindow::default(),
        }
    }

    /// Override the dedup window (tests, site-specific policy)
    pub fn with_dedup_window(mut self, window_ms: i64) -> Self {
        self.dedup = DedupWindow::new(window_ms);
        self
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Record an event at the current clock
    pub fn record(&self, request: RecordRequest) -> Result<FieldEvent, DuplicateVisit> {
        self.record_at(request, now_ms())
    }

    /// Record an event at an explicit clock reading
    ///
    /// `captured_at_ms` is fixed here and never overwritten by sync retries.
    pub fn record_at(
        &self,
        request: RecordRequest,
        captured_at_ms: i64,
    ) -> Result<FieldEvent, DuplicateVisit> {
        if request.kind == EventKind::CheckpointVisit {
            if let Some(checkpoint_id) = &request.checkpoint_id {
                self.dedup
                    .check_and_record(&self.actor_id, checkpoint_id, captured_at_ms)?;
            }
        }

        let event = FieldEvent {
            id: EventId::new(),
            idempotency_key: IdempotencyKey::new(),
            kind: request.kind,
            actor_id: self.actor_id.clone(),
            verification: request.verification,
            captured_location: request.location,
            captured_at_ms,
            checkpoint_id: request.checkpoint_id,
            notes: request.notes,
            device_info: self.device_info.clone(),
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_error: None,
            server_id: None,
        };

        debug!(
            event_id = %event.id,
            kind = %event.kind,
            actor = %event.actor_id,
            "Recorded field event"
        );
        Ok(event)
    }
}
