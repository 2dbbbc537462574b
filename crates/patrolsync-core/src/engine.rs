//! Main PatrolEngine - the primary entry point for PatrolSync
//!
//! PatrolEngine coordinates the verifier, recorder, offline queue and sync
//! engine for one device session:
//!
//! ```text
//! scan ──► TokenVerifier ──► GeofenceEvaluator ──► EventRecorder
//!                                                       │
//!                                          OfflineQueue (durable, pending)
//!                                                       │
//!                             SyncEngine drain ──► ingestion endpoint
//!                                                       │
//!                             confirmations ──► RealtimeBroadcaster
//! ```
//!
//! Verification, geofence and duplicate-visit failures surface synchronously
//! at scan time and are never queued. Token usage is incremented only after
//! the event is durably queued, so a rejected scan never consumes usage.
//!
//! # Example
//!
//! ```ignore
//! use patrolsync_core::{EngineConfig, PatrolEngine};
//!
//! let engine = PatrolEngine::new(config, registry, client)?;
//! engine.set_online(true);
//!
//! let event = engine
//!     .checkpoint_visit("CHK-001", ScanMethod::Qr, location)
//!     .await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GeofenceError, PatrolError, PatrolResult, VerificationError};
use crate::geofence;
use crate::queue::OfflineQueue;
use crate::recorder::{EventRecorder, RecordRequest, DEFAULT_DEDUP_WINDOW_MS};
use crate::sync::{IngestionClient, SyncConfig, SyncEngine, SyncEvent};
use crate::types::{
    now_ms, CapturedLocation, CheckpointDefinition, DeviceInfo, EventKind, FieldEvent, QueueStats,
    ScanMethod, SyncQueueEntry, VerificationRecord,
};
use crate::verify::{TokenRegistry, TokenVerifier};

/// Provides the device's current position
///
/// Implementations wrap the platform location stack; acquisition is bounded
/// by [`EngineConfig::location_timeout`] so a stalled fix never blocks a
/// concurrent sync drain.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<CapturedLocation, PatrolError>;
}

/// Configuration for one device pipeline
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the queue database and device logs
    pub data_dir: PathBuf,
    /// The guard this device session belongs to
    pub actor_id: String,
    /// Site whose checkpoints are in scope for nearest-checkpoint lookup
    pub site_id: String,
    pub device_info: DeviceInfo,
    /// Dedup window for repeat checkpoint visits
    pub dedup_window_ms: i64,
    /// Ceiling on a location fix
    pub location_timeout: Duration,
    pub sync: SyncConfig,
}

impl EngineConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        actor_id: impl Into<String>,
        site_id: impl Into<String>,
        device_info: DeviceInfo,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            actor_id: actor_id.into(),
            site_id: site_id.into(),
            device_info,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            location_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
        }
    }
}

/// Main entry point for one device's presence pipeline
///
/// Owns the offline queue, the verifier/recorder pair, the sync engine and
/// the connectivity signal. One engine per device session; there is no
/// multi-process sharing of a queue.
pub struct PatrolEngine<R: TokenRegistry, C: IngestionClient> {
    config: EngineConfig,
    registry: Arc<R>,
    verifier: TokenVerifier<R>,
    recorder: EventRecorder,
    queue: OfflineQueue,
    sync: SyncEngine<C>,
    online_tx: Arc<watch::Sender<bool>>,
    sync_task: JoinHandle<()>,
}

impl<R: TokenRegistry + 'static, C: IngestionClient + 'static> PatrolEngine<R, C> {
    /// Create an engine with the given data directory, registry and
    /// ingestion client.
    ///
    /// Opens (or creates) the queue database, returns any entries stranded
    /// in-flight by a crash to `pending`, and starts the sync trigger loop.
    /// The device starts in the online state; callers flip it with
    /// [`PatrolEngine::set_online`] as connectivity changes.
    pub fn new(config: EngineConfig, registry: Arc<R>, client: Arc<C>) -> PatrolResult<Self> {
        info!(data_dir = ?config.data_dir, actor = %config.actor_id, "Initializing PatrolEngine");
        std::fs::create_dir_all(&config.data_dir)?;

        let queue = OfflineQueue::open(config.data_dir.join("patrolsync.redb"))?;
        queue.recover_in_flight()?;

        let (online_tx, online_rx) = watch::channel(true);
        let sync = SyncEngine::new(queue.clone(), client, config.sync.clone(), online_rx);
        let sync_task = sync.start();

        let recorder = EventRecorder::new(config.actor_id.clone(), config.device_info.clone())
            .with_dedup_window(config.dedup_window_ms);

        Ok(Self {
            verifier: TokenVerifier::new(registry.clone()),
            registry,
            recorder,
            queue,
            sync,
            online_tx: Arc::new(online_tx),
            sync_task,
            config,
        })
    }

    /// Record a checkpoint visit from a token scan.
    ///
    /// Full pipeline: token validation, checkpoint resolution, capture-method
    /// check, inclusive geofence containment, dedup window, durable enqueue,
    /// usage increment, drain trigger.
    pub async fn checkpoint_visit(
        &self,
        code: &str,
        method: ScanMethod,
        location: CapturedLocation,
    ) -> PatrolResult<FieldEvent> {
        let descriptor = self.verifier.validate(code, now_ms()).await?;

        let checkpoint_id = descriptor.checkpoint_id.clone().ok_or_else(|| {
            VerificationError::InvalidCode(format!(
                "token {} is not bound to a checkpoint",
                descriptor.code
            ))
        })?;
        let checkpoint = self
            .registry
            .checkpoint(&checkpoint_id)
            .await?
            .ok_or_else(|| PatrolError::CheckpointNotFound(checkpoint_id.clone()))?;

        self.check_method(&checkpoint, method)?;
        self.check_geofence(&checkpoint, location)?;

        let event = self.recorder.record(RecordRequest {
            kind: EventKind::CheckpointVisit,
            verification: Some(VerificationRecord {
                code: descriptor.code.clone(),
                method,
            }),
            location,
            checkpoint_id: Some(checkpoint_id),
            notes: None,
        })?;

        self.accept(event, Some(&descriptor.code)).await
    }

    /// Record a shift check-in
    pub async fn check_in(
        &self,
        code: &str,
        method: ScanMethod,
        location: CapturedLocation,
    ) -> PatrolResult<FieldEvent> {
        self.attendance(EventKind::CheckIn, code, method, location)
            .await
    }

    /// Record a shift check-out
    pub async fn check_out(
        &self,
        code: &str,
        method: ScanMethod,
        location: CapturedLocation,
    ) -> PatrolResult<FieldEvent> {
        self.attendance(EventKind::CheckOut, code, method, location)
            .await
    }

    /// Report an incident at the current position.
    ///
    /// No token backs an incident; the nearest checkpoint of the site is
    /// attached for context when one exists.
    pub async fn report_incident(
        &self,
        location: CapturedLocation,
        notes: impl Into<String>,
    ) -> PatrolResult<FieldEvent> {
        self.alert(EventKind::Incident, location, Some(notes.into()))
            .await
    }

    /// Request backup at the current position
    pub async fn request_backup(&self, location: CapturedLocation) -> PatrolResult<FieldEvent> {
        self.alert(EventKind::BackupRequest, location, None).await
    }

    /// Acquire a location fix, bounded by the configured timeout
    pub async fn locate<P: LocationProvider>(
        &self,
        provider: &P,
    ) -> PatrolResult<CapturedLocation> {
        tokio::time::timeout(self.config.location_timeout, provider.current_location())
            .await
            .map_err(|_| PatrolError::LocationTimeout(self.config.location_timeout))?
    }

    /// Signal a connectivity change.
    ///
    /// The offline→online edge triggers a drain; going offline aborts any
    /// in-flight delivery and reverts its entry to `pending`.
    pub fn set_online(&self, online: bool) {
        debug!(online, "Connectivity changed");
        self.online_tx.send_replace(online);
    }

    /// Whether the device currently believes it is online
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Run a drain right now (also coalesces into a running one)
    pub async fn drain_now(&self) {
        self.sync.trigger_drain().await;
    }

    /// Subscribe to sync confirmations and failures
    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    /// Queue counts by status
    pub fn queue_stats(&self) -> PatrolResult<QueueStats> {
        Ok(self.queue.stats()?)
    }

    /// All queue entries, in capture order
    pub fn queue_entries(&self) -> PatrolResult<Vec<SyncQueueEntry>> {
        Ok(self.queue.entries()?)
    }

    /// Return failed entries to `pending` with a fresh attempt budget
    pub fn reset_failed(&self) -> PatrolResult<usize> {
        Ok(self.queue.reset_failed()?)
    }

    /// Stop the sync loop and abort any in-flight delivery
    pub fn shutdown(&self) {
        info!("Shutting down PatrolEngine");
        self.sync.shutdown();
        self.sync_task.abort();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal pipeline steps
    // ═══════════════════════════════════════════════════════════════════════

    async fn attendance(
        &self,
        kind: EventKind,
        code: &str,
        method: ScanMethod,
        location: CapturedLocation,
    ) -> PatrolResult<FieldEvent> {
        let descriptor = self.verifier.validate(code, now_ms()).await?;

        // Attendance tokens may be site-wide; geofence only applies when the
        // token is bound to a checkpoint.
        if let Some(checkpoint_id) = &descriptor.checkpoint_id {
            let checkpoint = self
                .registry
                .checkpoint(checkpoint_id)
                .await?
                .ok_or_else(|| PatrolError::CheckpointNotFound(checkpoint_id.clone()))?;
            self.check_method(&checkpoint, method)?;
            self.check_geofence(&checkpoint, location)?;
        }

        let event = self.recorder.record(RecordRequest {
            kind,
            verification: Some(VerificationRecord {
                code: descriptor.code.clone(),
                method,
            }),
            location,
            checkpoint_id: descriptor.checkpoint_id.clone(),
            notes: None,
        })?;

        self.accept(event, Some(&descriptor.code)).await
    }

    async fn alert(
        &self,
        kind: EventKind,
        location: CapturedLocation,
        notes: Option<String>,
    ) -> PatrolResult<FieldEvent> {
        let candidates = self
            .registry
            .checkpoints_for_site(&self.config.site_id)
            .await?;
        let nearest = geofence::nearest(location.point(), &candidates).map(|c| c.id.clone());

        let event = self.recorder.record(RecordRequest {
            kind,
            verification: None,
            location,
            checkpoint_id: nearest,
            notes,
        })?;

        self.accept(event, None).await
    }

    /// Durably queue an accepted event, then increment usage and trigger a
    /// drain. Enqueue failure aborts: the event is NOT recorded.
    async fn accept(&self, event: FieldEvent, token_code: Option<&str>) -> PatrolResult<FieldEvent> {
        self.queue.enqueue(event.clone())?;

        if let Some(code) = token_code {
            // The event is durably queued, so the scan counts even if the
            // usage write fails; the registry owns retrying that.
            if let Err(e) = self.registry.increment_usage(code).await {
                warn!(code, error = %e, "Could not increment token usage");
            }
        }

        if self.is_online() {
            // Fire the drain without blocking the scan result; a drain that
            // is already running coalesces the trigger.
            let sync = self.sync.clone();
            tokio::spawn(async move { sync.trigger_drain().await });
        }
        Ok(event)
    }

    fn check_method(
        &self,
        checkpoint: &CheckpointDefinition,
        method: ScanMethod,
    ) -> Result<(), VerificationError> {
        if !checkpoint.allows(method) {
            return Err(VerificationError::InvalidCode(format!(
                "method {} not allowed at checkpoint {}",
                method, checkpoint.id
            )));
        }
        Ok(())
    }

    fn check_geofence(
        &self,
        checkpoint: &CheckpointDefinition,
        location: CapturedLocation,
    ) -> Result<(), GeofenceError> {
        let distance_meters = geofence::distance_meters(location.point(), checkpoint.center);
        if distance_meters > checkpoint.radius_meters {
            return Err(GeofenceError::OutOfRange {
                distance_meters,
                radius_meters: checkpoint.radius_meters,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MemoryIngestionServer;
    use crate::types::{CheckpointId, GeoPoint, SyncStatus, TokenKind, VerificationToken};
    use crate::verify::MemoryTokenRegistry;
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "device-1".into(),
            platform: "android".into(),
            app_version: "2.4.1".into(),
        }
    }

    fn seeded_registry() -> Arc<MemoryTokenRegistry> {
        let registry = Arc::new(MemoryTokenRegistry::new());
        registry.insert_checkpoint(CheckpointDefinition {
            id: CheckpointId::new("cp-gate"),
            site_id: "site-1".into(),
            center: GeoPoint::new(51.5000, -0.1200),
            radius_meters: 50.0,
            allowed_methods: vec![ScanMethod::Qr, ScanMethod::Nfc],
        });
        registry.insert_token(VerificationToken {
            code: "CHK-GATE".into(),
            nfc_tag_id: Some("04:A3:2B:11".into()),
            kind: TokenKind::Checkpoint,
            valid_from_ms: 0,
            valid_until_ms: None,
            usage_limit: None,
            usage_count: 0,
            active: true,
            checkpoint_id: Some(CheckpointId::new("cp-gate")),
        });
        registry
    }

    fn engine(
        registry: Arc<MemoryTokenRegistry>,
    ) -> (
        PatrolEngine<MemoryTokenRegistry, MemoryIngestionServer>,
        Arc<MemoryIngestionServer>,
        TempDir,
    ) {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MemoryIngestionServer::new());
        let config = EngineConfig::new(dir.path(), "guard-7", "site-1", device());
        let engine = PatrolEngine::new(config, registry, server.clone()).unwrap();
        (engine, server, dir)
    }

    // ~30m east of cp-gate's center (still inside the 50m radius)
    fn inside_location() -> CapturedLocation {
        CapturedLocation::new(51.5000, -0.11957, 5.0)
    }

    // ~350m east, well outside the radius
    fn outside_location() -> CapturedLocation {
        CapturedLocation::new(51.5000, -0.1150, 5.0)
    }

    async fn wait_for_synced(
        engine: &PatrolEngine<MemoryTokenRegistry, MemoryIngestionServer>,
        id: &crate::types::EventId,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = engine.queue_entries().unwrap();
                if entries
                    .iter()
                    .any(|e| e.event.id == *id && e.event.sync_status == SyncStatus::Synced)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("entry was not synced in time");
    }

    #[tokio::test]
    async fn test_visit_inside_geofence_is_accepted_and_synced() {
        let registry = seeded_registry();
        let (engine, server, _dir) = engine(registry.clone());

        let event = engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Qr, inside_location())
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::CheckpointVisit);
        assert_eq!(event.checkpoint_id, Some(CheckpointId::new("cp-gate")));

        // Online at accept time: the triggered drain delivers it
        wait_for_synced(&engine, &event.id).await;
        assert_eq!(server.stored_count().await, 1);
        assert_eq!(registry.usage_count("CHK-GATE"), Some(1));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_visit_outside_geofence_is_rejected_synchronously() {
        let registry = seeded_registry();
        let (engine, server, _dir) = engine(registry.clone());

        let err = engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Qr, outside_location())
            .await
            .unwrap_err();
        assert!(matches!(err, PatrolError::Geofence(_)));

        // Nothing queued, nothing delivered, no usage consumed
        assert!(engine.queue_entries().unwrap().is_empty());
        assert_eq!(server.stored_count().await, 0);
        assert_eq!(registry.usage_count("CHK-GATE"), Some(0));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_disallowed_method_is_rejected() {
        let registry = seeded_registry();
        let (engine, _server, _dir) = engine(registry);

        let err = engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Manual, inside_location())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PatrolError::Verification(VerificationError::InvalidCode(_))
        ));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_repeat_visit_is_a_duplicate_notice() {
        let registry = seeded_registry();
        let (engine, _server, _dir) = engine(registry.clone());

        engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Qr, inside_location())
            .await
            .unwrap();
        let err = engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Qr, inside_location())
            .await
            .unwrap_err();
        assert!(matches!(err, PatrolError::DuplicateVisit(_)));

        // The duplicate consumed no token usage
        assert_eq!(registry.usage_count("CHK-GATE"), Some(1));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_offline_visit_stays_pending() {
        let registry = seeded_registry();
        let (engine, server, _dir) = engine(registry);

        engine.set_online(false);
        engine
            .checkpoint_visit("CHK-GATE", ScanMethod::Nfc, inside_location())
            .await
            .unwrap();

        let entry = engine.queue_entries().unwrap().pop().unwrap();
        assert_eq!(entry.event.sync_status, SyncStatus::Pending);
        assert_eq!(server.stored_count().await, 0);

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_incident_attaches_nearest_checkpoint() {
        let registry = seeded_registry();
        registry.insert_checkpoint(CheckpointDefinition {
            id: CheckpointId::new("cp-far"),
            site_id: "site-1".into(),
            center: GeoPoint::new(52.0, -1.0),
            radius_meters: 50.0,
            allowed_methods: vec![ScanMethod::Qr],
        });
        let (engine, _server, _dir) = engine(registry);
        engine.set_online(false);

        let event = engine
            .report_incident(inside_location(), "broken window at gate")
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::Incident);
        assert_eq!(event.checkpoint_id, Some(CheckpointId::new("cp-gate")));
        assert!(event.verification.is_none());
        assert_eq!(event.notes.as_deref(), Some("broken window at gate"));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_locate_times_out() {
        struct StalledProvider;

        #[async_trait]
        impl LocationProvider for StalledProvider {
            async fn current_location(&self) -> Result<CapturedLocation, PatrolError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let registry = seeded_registry();
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path(), "guard-7", "site-1", device());
        config.location_timeout = Duration::from_millis(50);
        let engine =
            PatrolEngine::new(config, registry, Arc::new(MemoryIngestionServer::new())).unwrap();

        let err = engine.locate(&StalledProvider).await.unwrap_err();
        assert!(matches!(err, PatrolError::LocationTimeout(_)));

        engine.shutdown();
    }
}
