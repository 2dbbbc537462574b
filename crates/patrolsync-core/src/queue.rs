//! Durable offline queue using redb.
//!
//! Field events captured while the device is offline wait here until a sync
//! drain delivers them. The queue is the single owner of an event's
//! `sync_status` / `sync_attempts` / `last_error` / `server_id` fields once
//! the event is enqueued; no other component writes queue state.
//!
//! Every operation runs inside one redb write transaction, so a concurrent
//! enqueue can never be lost to a read-modify-write race and a partial
//! status update can never be observed after a crash.
//!
//! ## Entry lifecycle
//!
//! ```text
//! pending ──► syncing ──► synced            (terminal)
//!                │
//!                ├──────► failed            (retryable until the attempt
//!                │          │                ceiling, then skipped by
//!                │          └► pending       normal drains; reset_failed()
//!                │             (retry)       returns it to pending)
//!                └──────► pending           (cancellation: connectivity
//!                                            dropped mid-flight, no
//!                                            attempt consumed)
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::types::{now_ms, EventId, FieldEvent, QueueStats, SyncQueueEntry, SyncStatus};

// Keyed by the event's ULID string, so iteration order is capture order.
const QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_queue");

/// Maximum delivery attempts before normal drains skip an entry
pub const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Base delay before a failed entry becomes eligible again; doubles per attempt
const RETRY_BASE_DELAY_MS: i64 = 30_000;

/// Durable local store of pending and failed field events
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<RwLock<Database>>,
}

impl OfflineQueue {
    /// Open (or create) the queue database at the given path.
    ///
    /// Creates the parent directory and the queue table if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::PersistFailed(e.to_string()))?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(QUEUE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Add a freshly recorded event to the queue as `pending`.
    ///
    /// Any storage failure surfaces as `PersistFailed`; the caller must not
    /// report the event as recorded in that case.
    pub fn enqueue(&self, mut event: FieldEvent) -> Result<SyncQueueEntry, QueueError> {
        event.sync_status = SyncStatus::Pending;

        let entry = SyncQueueEntry {
            event,
            enqueued_at_ms: now_ms(),
            next_retry_at_ms: None,
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(QUEUE_TABLE)?;
            let key = entry.event.id.as_ulid().to_string();
            let data = serde_json::to_vec(&entry)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!(event_id = %entry.event.id, "Enqueued field event");
        Ok(entry)
    }

    /// Entries eligible for the next drain, in capture order.
    ///
    /// Includes `pending` entries and `failed` entries that are under the
    /// attempt ceiling and past their `next_retry_at_ms`.
    pub fn pending_entries(
        &self,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<Vec<SyncQueueEntry>, QueueError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;

        let mut eligible = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let entry: SyncQueueEntry = serde_json::from_slice(value.value())
                .map_err(|e| QueueError::Serialization(e.to_string()))?;

            let ready = match entry.event.sync_status {
                SyncStatus::Pending => true,
                SyncStatus::Failed => {
                    entry.event.sync_attempts < max_attempts
                        && entry.next_retry_at_ms.map_or(true, |at| at <= now_ms)
                }
                SyncStatus::Syncing | SyncStatus::Synced => false,
            };
            if ready {
                eligible.push(entry);
            }
        }
        Ok(eligible)
    }

    /// Mark an entry as in-flight before the network call
    pub fn mark_syncing(&self, id: &EventId) -> Result<(), QueueError> {
        self.mutate(id, |entry| {
            match entry.event.sync_status {
                SyncStatus::Pending | SyncStatus::Failed => {}
                from => {
                    return Err(QueueError::InvalidTransition {
                        id: entry.event.id,
                        from,
                        to: SyncStatus::Syncing,
                    })
                }
            }
            entry.event.sync_status = SyncStatus::Syncing;
            Ok(())
        })
    }

    /// Record a confirmed delivery. Terminal.
    pub fn mark_synced(&self, id: &EventId, server_id: &str) -> Result<(), QueueError> {
        self.mutate(id, |entry| {
            entry.event.sync_status = SyncStatus::Synced;
            entry.event.server_id = Some(server_id.to_string());
            entry.event.last_error = None;
            entry.next_retry_at_ms = None;
            Ok(())
        })
    }

    /// Record a transient delivery failure.
    ///
    /// Bumps the attempt counter and schedules the next eligibility with a
    /// doubling delay; the periodic drain provides the actual retry cadence.
    pub fn mark_failed(&self, id: &EventId, error: &str) -> Result<(), QueueError> {
        self.mutate(id, |entry| {
            entry.event.sync_status = SyncStatus::Failed;
            entry.event.sync_attempts += 1;
            entry.event.last_error = Some(error.to_string());
            let backoff =
                RETRY_BASE_DELAY_MS << (entry.event.sync_attempts.saturating_sub(1)).min(6);
            entry.next_retry_at_ms = Some(now_ms() + backoff);
            Ok(())
        })
    }

    /// Record a terminal server rejection.
    ///
    /// Rejected entries must not be retried automatically, so attempts are
    /// pinned at the ceiling; the entry stays visible to operator views.
    pub fn mark_rejected(&self, id: &EventId, reason: &str) -> Result<(), QueueError> {
        self.mutate(id, |entry| {
            entry.event.sync_status = SyncStatus::Failed;
            entry.event.sync_attempts = entry.event.sync_attempts.max(MAX_SYNC_ATTEMPTS);
            entry.event.last_error = Some(reason.to_string());
            entry.next_retry_at_ms = None;
            Ok(())
        })
    }

    /// Return an in-flight entry to `pending` without consuming an attempt.
    ///
    /// Used when connectivity drops mid-drain: a transient disconnect must
    /// not count against the attempt budget.
    pub fn revert_to_pending(&self, id: &EventId) -> Result<(), QueueError> {
        self.mutate(id, |entry| {
            entry.event.sync_status = SyncStatus::Pending;
            Ok(())
        })
    }

    /// Return entries stranded in `syncing` by a crash to `pending`.
    ///
    /// Called once on startup, before the first drain.
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let recovered = self.mutate_all(|entry| {
            if entry.event.sync_status == SyncStatus::Syncing {
                entry.event.sync_status = SyncStatus::Pending;
                true
            } else {
                false
            }
        })?;

        if recovered > 0 {
            warn!(recovered, "Recovered in-flight entries after restart");
        }
        Ok(recovered)
    }

    /// Clear attempts and errors on all failed entries, returning them to
    /// `pending` so the next drain picks them up.
    pub fn reset_failed(&self) -> Result<usize, QueueError> {
        let reset = self.mutate_all(|entry| {
            if entry.event.sync_status == SyncStatus::Failed {
                entry.event.sync_status = SyncStatus::Pending;
                entry.event.sync_attempts = 0;
                entry.event.last_error = None;
                entry.next_retry_at_ms = None;
                true
            } else {
                false
            }
        })?;

        info!(reset, "Reset failed queue entries");
        Ok(reset)
    }

    /// Fetch a single entry by event id
    pub fn get(&self, id: &EventId) -> Result<Option<SyncQueueEntry>, QueueError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        let key = id.as_ulid().to_string();

        match table.get(key.as_str())? {
            Some(v) => {
                let entry: SyncQueueEntry = serde_json::from_slice(v.value())
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// All entries, in capture order
    pub fn entries(&self) -> Result<Vec<SyncQueueEntry>, QueueError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;

        let mut entries = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let entry: SyncQueueEntry = serde_json::from_slice(value.value())
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Counts by status plus the oldest pending capture timestamp
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for entry in self.entries()? {
            match entry.event.sync_status {
                SyncStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_ms = Some(match stats.oldest_pending_ms {
                        Some(oldest) => oldest.min(entry.event.captured_at_ms),
                        None => entry.event.captured_at_ms,
                    });
                }
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Read-modify-write one entry inside a single write transaction
    fn mutate<F>(&self, id: &EventId, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut SyncQueueEntry) -> Result<(), QueueError>,
    {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(QUEUE_TABLE)?;
            let key = id.as_ulid().to_string();

            let mut entry: SyncQueueEntry = match table.get(key.as_str())? {
                Some(v) => serde_json::from_slice(v.value())
                    .map_err(|e| QueueError::Serialization(e.to_string()))?,
                None => return Err(QueueError::EntryNotFound(*id)),
            };

            f(&mut entry)?;

            let data = serde_json::to_vec(&entry)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read-modify-write every entry inside a single write transaction.
    /// Returns the number of entries the closure changed.
    fn mutate_all<F>(&self, mut f: F) -> Result<usize, QueueError>
    where
        F: FnMut(&mut SyncQueueEntry) -> bool,
    {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut changed = 0;
        {
            let mut table = write_txn.open_table(QUEUE_TABLE)?;

            let mut updates = Vec::new();
            for item in table.iter()? {
                let (key, value) = item?;
                let mut entry: SyncQueueEntry = serde_json::from_slice(value.value())
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                if f(&mut entry) {
                    let data = serde_json::to_vec(&entry)
                        .map_err(|e| QueueError::Serialization(e.to_string()))?;
                    updates.push((key.value().to_string(), data));
                }
            }

            for (key, data) in updates {
                changed += 1;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(changed)
    }
}
