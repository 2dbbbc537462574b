//! Queue drain engine
//!
//! Drains eligible queue entries to the ingestion endpoint, one entry at a
//! time, marking each `syncing` before the network call and
//! `synced`/`failed` after.
//!
//! ## Triggers
//!
//! 1. Immediately after an enqueue while online (the orchestrator calls
//!    [`SyncEngine::trigger_drain`])
//! 2. The offline→online transition on the connectivity watch channel
//! 3. A periodic timer (5 minutes) — this is also the retry cadence for
//!    failed entries; there is no per-entry timer fleet
//!
//! ## Single-flight
//!
//! At most one drain cycle runs at a time. A trigger arriving while a drain
//! is in progress sets a coalescing flag; the running drain makes one
//! follow-up pass instead of a second drain starting concurrently.
//!
//! ## Cancellation
//!
//! If connectivity drops (or the engine shuts down) while an entry is in
//! flight, the request is aborted and the entry reverts to `pending` —
//! a transient disconnect never consumes an attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::SyncEvent;
use super::ingest::{IngestResponse, IngestionClient};
use crate::error::SyncError;
use crate::queue::{OfflineQueue, MAX_SYNC_ATTEMPTS};
use crate::types::{now_ms, SyncQueueEntry, SyncStatus};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs for the drain engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempt ceiling; entries at or above it are skipped by normal drains
    pub max_attempts: u32,
    /// Cadence of the periodic drain trigger
    pub drain_interval: Duration,
    /// Per-request delivery timeout
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SYNC_ATTEMPTS,
            drain_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Drains the offline queue to the ingestion endpoint
pub struct SyncEngine<C: IngestionClient> {
    queue: OfflineQueue,
    client: Arc<C>,
    config: SyncConfig,
    online_rx: watch::Receiver<bool>,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
    drain_requested: Arc<AtomicBool>,
    event_tx: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
}

impl<C: IngestionClient> Clone for SyncEngine<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            online_rx: self.online_rx.clone(),
            drain_lock: self.drain_lock.clone(),
            drain_requested: self.drain_requested.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: IngestionClient + 'static> SyncEngine<C> {
    /// Create a drain engine over a queue and an ingestion client.
    ///
    /// `online_rx` carries the device's connectivity state; drains only run
    /// while it reads `true`.
    pub fn new(
        queue: OfflineQueue,
        client: Arc<C>,
        config: SyncConfig,
        online_rx: watch::Receiver<bool>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            client,
            config,
            online_rx,
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            drain_requested: Arc::new(AtomicBool::new(false)),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to drain/entry events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Start the background trigger loop (timer + connectivity edges).
    ///
    /// The loop also runs an initial drain to pick up any backlog left from
    /// a previous session.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut online_rx = engine.online_rx.clone();
            let mut interval = tokio::time::interval(engine.config.drain_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => {
                        debug!("Sync trigger loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        engine.trigger_drain().await;
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow_and_update() {
                            info!("Connectivity restored; triggering drain");
                            engine.trigger_drain().await;
                        }
                    }
                }
            }
        })
    }

    /// Stop the trigger loop and abort any in-flight delivery
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Request a drain.
    ///
    /// If no drain is running, this runs one (and any coalesced follow-up)
    /// before returning. If a drain is already in progress the request is
    /// coalesced into it and this returns immediately.
    pub async fn trigger_drain(&self) {
        self.drain_requested.store(true, Ordering::SeqCst);

        let Ok(_guard) = self.drain_lock.clone().try_lock_owned() else {
            debug!("Drain already in flight; trigger coalesced");
            return;
        };

        while self.drain_requested.swap(false, Ordering::SeqCst) {
            self.drain_once().await;
        }
    }

    /// One drain cycle over the currently eligible entries
    async fn drain_once(&self) {
        if !*self.online_rx.borrow() {
            debug!("Offline; skipping drain");
            return;
        }

        let entries = match self.queue.pending_entries(self.config.max_attempts, now_ms()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read queue for drain");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        info!(eligible = entries.len(), "Drain started");
        let _ = self.event_tx.send(SyncEvent::DrainStarted {
            eligible: entries.len(),
        });

        let mut online_rx = self.online_rx.clone();
        let (mut synced, mut failed, mut rejected) = (0, 0, 0);

        for entry in entries {
            if !self.deliver_entry(&entry, &mut online_rx, &mut synced, &mut failed, &mut rejected).await {
                break;
            }
        }

        info!(synced, failed, rejected, "Drain finished");
        let _ = self.event_tx.send(SyncEvent::DrainFinished {
            synced,
            failed,
            rejected,
        });
    }

    /// Deliver one entry. Returns `false` when the drain should stop
    /// (connectivity lost or shutdown).
    async fn deliver_entry(
        &self,
        entry: &SyncQueueEntry,
        online_rx: &mut watch::Receiver<bool>,
        synced: &mut usize,
        failed: &mut usize,
        rejected: &mut usize,
    ) -> bool {
        let id = entry.event.id;

        if let Err(e) = self.queue.mark_syncing(&id) {
            warn!(event_id = %id, error = %e, "Skipping entry");
            return true;
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = wait_for_offline(online_rx) => None,
            result = tokio::time::timeout(
                self.config.request_timeout,
                self.client.deliver(&entry.event),
            ) => Some(result),
        };

        match outcome {
            // Aborted mid-flight: revert without consuming an attempt
            None => {
                info!(event_id = %id, "Delivery aborted; reverting to pending");
                if let Err(e) = self.queue.revert_to_pending(&id) {
                    warn!(event_id = %id, error = %e, "Could not revert entry");
                }
                let _ = self.event_tx.send(SyncEvent::EntryReverted { event_id: id });
                false
            }
            Some(Err(_)) => {
                let error = SyncError::Timeout(self.config.request_timeout);
                self.record_failure(entry, &error, failed);
                true
            }
            Some(Ok(Ok(response))) => {
                self.record_response(entry, response, synced, rejected);
                true
            }
            Some(Ok(Err(error))) => {
                if error.is_transient() {
                    self.record_failure(entry, &error, failed);
                } else {
                    self.record_rejection(entry, error.to_string(), rejected);
                }
                true
            }
        }
    }

    fn record_response(
        &self,
        entry: &SyncQueueEntry,
        response: IngestResponse,
        synced: &mut usize,
        rejected: &mut usize,
    ) {
        let id = entry.event.id;
        match response {
            IngestResponse::Accepted { server_id } => {
                self.record_confirmed(entry, server_id, false, synced);
            }
            IngestResponse::Duplicate { server_id } => {
                // The server already held this idempotency key; same record
                warn!(
                    event_id = %id,
                    notice = %SyncError::ServerDuplicate(server_id.clone()),
                    "Treating duplicate as confirmed"
                );
                self.record_confirmed(entry, server_id, true, synced);
            }
            IngestResponse::Rejected { reason } => {
                self.record_rejection(entry, reason, rejected);
            }
        }
    }

    fn record_confirmed(
        &self,
        entry: &SyncQueueEntry,
        server_id: String,
        duplicate: bool,
        synced: &mut usize,
    ) {
        let id = entry.event.id;
        if let Err(e) = self.queue.mark_synced(&id, &server_id) {
            warn!(event_id = %id, error = %e, "Could not mark entry synced");
            return;
        }
        *synced += 1;
        debug!(event_id = %id, %server_id, duplicate, "Entry synced");

        let mut confirmed = entry.event.clone();
        confirmed.sync_status = SyncStatus::Synced;
        confirmed.server_id = Some(server_id.clone());
        confirmed.last_error = None;
        let _ = self.event_tx.send(SyncEvent::EntrySynced {
            event: confirmed,
            server_id,
            duplicate,
        });
    }

    fn record_failure(&self, entry: &SyncQueueEntry, error: &SyncError, failed: &mut usize) {
        let id = entry.event.id;
        let message = error.to_string();
        if let Err(e) = self.queue.mark_failed(&id, &message) {
            warn!(event_id = %id, error = %e, "Could not mark entry failed");
            return;
        }
        *failed += 1;
        let attempts = entry.event.sync_attempts + 1;
        warn!(event_id = %id, attempts, error = %message, "Entry delivery failed");
        let _ = self.event_tx.send(SyncEvent::EntryFailed {
            event_id: id,
            attempts,
            error: message,
        });
    }

    fn record_rejection(&self, entry: &SyncQueueEntry, reason: String, rejected: &mut usize) {
        let id = entry.event.id;
        if let Err(e) = self.queue.mark_rejected(&id, &reason) {
            warn!(event_id = %id, error = %e, "Could not mark entry rejected");
            return;
        }
        *rejected += 1;
        warn!(event_id = %id, %reason, "Entry rejected by server; will not retry");
        let _ = self.event_tx.send(SyncEvent::EntryRejected {
            event_id: id,
            reason,
        });
    }
}

/// Resolves when the connectivity watch reads `false`.
/// Pends forever if the sender is gone, leaving cancellation to the token.
async fn wait_for_offline(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CapturedLocation, DeviceInfo, EventId, EventKind, FieldEvent, IdempotencyKey,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn event() -> FieldEvent {
        FieldEvent {
            id: EventId::new(),
            idempotency_key: IdempotencyKey::new(),
            kind: EventKind::CheckpointVisit,
            actor_id: "guard-7".into(),
            verification: None,
            captured_location: CapturedLocation::new(51.5, -0.12, 8.0),
            captured_at_ms: now_ms(),
            checkpoint_id: None,
            notes: None,
            device_info: DeviceInfo {
                device_id: "device-1".into(),
                platform: "android".into(),
                app_version: "2.4.1".into(),
            },
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_error: None,
            server_id: None,
        }
    }

    fn queue() -> (OfflineQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path().join("queue.redb")).unwrap();
        (queue, dir)
    }

    /// Client that fails with a network error a fixed number of times,
    /// then accepts everything.
    struct FlakyClient {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    impl FlakyClient {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                delivered: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IngestionClient for FlakyClient {
        async fn deliver(&self, event: &FieldEvent) -> Result<IngestResponse, SyncError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Network("connection reset".into()));
            }
            let n = self.delivered.fetch_add(1, Ordering::SeqCst);
            let _ = event;
            Ok(IngestResponse::Accepted {
                server_id: format!("srv-{n}"),
            })
        }
    }

    /// Client that rejects everything
    struct RejectingClient;

    #[async_trait]
    impl IngestionClient for RejectingClient {
        async fn deliver(&self, _event: &FieldEvent) -> Result<IngestResponse, SyncError> {
            Ok(IngestResponse::Rejected {
                reason: "geofence violation".into(),
            })
        }
    }

    /// Client that stalls until cancelled
    struct StallingClient;

    #[async_trait]
    impl IngestionClient for StallingClient {
        async fn deliver(&self, _event: &FieldEvent) -> Result<IngestResponse, SyncError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("delivery should have been aborted");
        }
    }

    fn engine<C: IngestionClient + 'static>(
        queue: OfflineQueue,
        client: C,
    ) -> (SyncEngine<C>, watch::Sender<bool>) {
        let (online_tx, online_rx) = watch::channel(true);
        let engine = SyncEngine::new(queue, Arc::new(client), SyncConfig::default(), online_rx);
        (engine, online_tx)
    }

    #[tokio::test]
    async fn test_drain_delivers_pending_entries() {
        let (queue, _dir) = queue();
        let a = event();
        let b = event();
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let (engine, _online) = engine(queue.clone(), FlakyClient::new(0));
        engine.trigger_drain().await;

        for id in [a.id, b.id] {
            let entry = queue.get(&id).unwrap().unwrap();
            assert_eq!(entry.event.sync_status, SyncStatus::Synced);
            assert!(entry.event.server_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_transient_failure_marks_failed_and_counts_attempt() {
        let (queue, _dir) = queue();
        let e = event();
        let id = e.id;
        queue.enqueue(e).unwrap();

        let (engine, _online) = engine(queue.clone(), FlakyClient::new(1));
        engine.trigger_drain().await;

        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Failed);
        assert_eq!(entry.event.sync_attempts, 1);

        // After an operator reset the same engine delivers it
        queue.reset_failed().unwrap();
        engine.trigger_drain().await;
        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_terminal() {
        let (queue, _dir) = queue();
        let e = event();
        let id = e.id;
        queue.enqueue(e).unwrap();

        let (engine, _online) = engine(queue.clone(), RejectingClient);
        let mut events = engine.subscribe();
        engine.trigger_drain().await;

        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Failed);
        assert!(entry.event.sync_attempts >= MAX_SYNC_ATTEMPTS);

        // A second drain does not touch it
        engine.trigger_drain().await;
        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.last_error.as_deref(), Some("geofence violation"));

        let mut saw_rejection = false;
        while let Ok(evt) = events.try_recv() {
            if matches!(evt, SyncEvent::EntryRejected { .. }) {
                saw_rejection = true;
            }
        }
        assert!(saw_rejection);
    }

    #[tokio::test]
    async fn test_offline_drain_is_a_no_op() {
        let (queue, _dir) = queue();
        let e = event();
        let id = e.id;
        queue.enqueue(e).unwrap();

        let (engine, online) = engine(queue.clone(), FlakyClient::new(0));
        online.send(false).unwrap();
        engine.trigger_drain().await;

        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connectivity_loss_mid_drain_reverts_entry() {
        let (queue, _dir) = queue();
        let e = event();
        let id = e.id;
        queue.enqueue(e).unwrap();

        let (engine, online) = engine(queue.clone(), StallingClient);
        let drained = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.trigger_drain().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        online.send(false).unwrap();
        drained.await.unwrap();

        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Pending);
        // A transient disconnect does not count against the attempt budget
        assert_eq!(entry.event.sync_attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_triggers_coalesce() {
        let (queue, _dir) = queue();
        let e = event();
        queue.enqueue(e).unwrap();

        let client = Arc::new(FlakyClient::new(0));
        let (online_tx, online_rx) = watch::channel(true);
        let engine = SyncEngine::new(
            queue.clone(),
            client.clone(),
            SyncConfig::default(),
            online_rx,
        );
        drop(online_tx);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.trigger_drain().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // One entry, eight triggers: exactly one delivery
        assert_eq!(client.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_response_counts_as_synced() {
        let (queue, _dir) = queue();
        let e = event();
        let id = e.id;
        queue.enqueue(e).unwrap();

        // Pre-seed the server with the same idempotency key
        let server = super::super::ingest::MemoryIngestionServer::new();
        let entry = queue.get(&id).unwrap().unwrap();
        let seeded = server.deliver(&entry.event).await.unwrap();
        let IngestResponse::Accepted { server_id } = seeded else {
            panic!("seed delivery should be accepted");
        };

        let (online_tx, online_rx) = watch::channel(true);
        let engine = SyncEngine::new(
            queue.clone(),
            Arc::new(server),
            SyncConfig::default(),
            online_rx,
        );
        drop(online_tx);
        let mut events = engine.subscribe();
        engine.trigger_drain().await;

        let entry = queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Synced);
        assert_eq!(entry.event.server_id, Some(server_id));

        let mut saw_duplicate = false;
        while let Ok(evt) = events.try_recv() {
            if let SyncEvent::EntrySynced { duplicate, .. } = evt {
                saw_duplicate = duplicate;
            }
        }
        assert!(saw_duplicate);
    }
}
