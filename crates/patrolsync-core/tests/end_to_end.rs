//! End-to-end pipeline test
//!
//! Walks the whole scenario: a guard scans a checkpoint inside its geofence
//! while the device is offline, the event waits in the durable queue, the
//! device comes back online, the drain delivers it, and the confirmation is
//! republished to a subscribed dashboard.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use patrolsync_core::realtime::{channel_transport, BroadcasterConfig, RealtimeBroadcaster};
use patrolsync_core::sync::MemoryIngestionServer;
use patrolsync_core::types::{
    CapturedLocation, CheckpointDefinition, CheckpointId, DeviceInfo, GeoPoint, ScanMethod,
    SyncStatus, TokenKind, VerificationToken,
};
use patrolsync_core::verify::MemoryTokenRegistry;
use patrolsync_core::{EngineConfig, PatrolEngine};

fn device() -> DeviceInfo {
    DeviceInfo {
        device_id: "device-1".into(),
        platform: "android".into(),
        app_version: "2.4.1".into(),
    }
}

/// Checkpoint A: radius 50m around the site gate
fn seeded_registry() -> Arc<MemoryTokenRegistry> {
    let registry = Arc::new(MemoryTokenRegistry::new());
    registry.insert_checkpoint(CheckpointDefinition {
        id: CheckpointId::new("checkpoint-a"),
        site_id: "site-1".into(),
        center: GeoPoint::new(51.5000, -0.1200),
        radius_meters: 50.0,
        allowed_methods: vec![ScanMethod::Qr, ScanMethod::Nfc],
    });
    registry.insert_token(VerificationToken {
        code: "CHK-A".into(),
        nfc_tag_id: None,
        kind: TokenKind::Checkpoint,
        valid_from_ms: 0,
        valid_until_ms: None,
        usage_limit: None,
        usage_count: 0,
        active: true,
        checkpoint_id: Some(CheckpointId::new("checkpoint-a")),
    });
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_scan_syncs_and_republishes_when_online() {
    let dir = TempDir::new().unwrap();
    let registry = seeded_registry();
    let server = Arc::new(MemoryIngestionServer::new());

    let config = EngineConfig::new(dir.path(), "guard-7", "site-1", device());
    let engine = PatrolEngine::new(config, registry, server.clone()).unwrap();

    // Realtime channel for the monitoring dashboard, mirroring confirmations
    let (transport, mut accept_rx) = channel_transport();
    let broadcaster = RealtimeBroadcaster::new(
        Arc::new(transport),
        BroadcasterConfig::new("org-1", "guard-7"),
    );
    let mut dashboard = broadcaster.subscribe();
    let _mirror = broadcaster.mirror_sync_events(engine.subscribe_sync_events());
    let _channel = broadcaster.start();

    // The in-memory "server" loops confirmed messages straight back to
    // subscribed clients, standing in for the real fan-out service.
    let mut endpoint = accept_rx.recv().await.unwrap();
    tokio::spawn(async move {
        while let Some(text) = endpoint.from_client.recv().await {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            match frame["type"].as_str() {
                Some("subscribe") | Some("pong") => {}
                Some("ping") => {
                    let _ = endpoint.to_client.send(r#"{"type":"pong"}"#.into());
                }
                _ => {
                    let _ = endpoint.to_client.send(text);
                }
            }
        }
    });

    // Guard scans checkpoint A while ~30m from its center, device offline
    engine.set_online(false);
    let location = CapturedLocation::new(51.5000, -0.11957, 8.0);
    let event = engine
        .checkpoint_visit("CHK-A", ScanMethod::Qr, location)
        .await
        .unwrap();

    // The event is durably queued, not delivered
    let entry = engine.queue_entries().unwrap().pop().unwrap();
    assert_eq!(entry.event.sync_status, SyncStatus::Pending);
    assert_eq!(server.stored_count().await, 0);

    // Device comes back online; the connectivity edge triggers a drain
    engine.set_online(true);

    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let entries = engine.queue_entries().unwrap();
            if entries
                .iter()
                .any(|e| e.event.id == event.id && e.event.sync_status == SyncStatus::Synced)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event was not synced after reconnect");

    let entry = engine.queue_entries().unwrap().pop().unwrap();
    let server_id = entry.event.server_id.clone().expect("server id set");
    assert_eq!(server.stored_count().await, 1);

    // The dashboard receives a patrols message carrying the server id
    let message = tokio::time::timeout(deadline, dashboard.recv())
        .await
        .expect("no realtime message arrived")
        .unwrap();
    assert_eq!(message.category.to_string(), "patrols");
    assert_eq!(message.organization_id, "org-1");
    assert_eq!(message.data["serverId"], server_id.as_str());
    assert_eq!(message.data["actorId"], "guard-7");

    broadcaster.shutdown();
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retried_delivery_references_the_same_record() {
    let dir = TempDir::new().unwrap();
    let registry = seeded_registry();
    let server = Arc::new(MemoryIngestionServer::new());

    let config = EngineConfig::new(dir.path(), "guard-7", "site-1", device());
    let engine = PatrolEngine::new(config, registry, server.clone()).unwrap();
    engine.set_online(false);

    let location = CapturedLocation::new(51.5000, -0.11957, 8.0);
    let event = engine
        .checkpoint_visit("CHK-A", ScanMethod::Qr, location)
        .await
        .unwrap();

    // Deliver once out of band, as if a previous drain's response was lost
    let entry = engine.queue_entries().unwrap().pop().unwrap();
    use patrolsync_core::sync::{IngestResponse, IngestionClient};
    let first = server.deliver(&entry.event).await.unwrap();
    let IngestResponse::Accepted { server_id: first_id } = first else {
        panic!("expected accepted");
    };

    // The engine's own drain hits the duplicate path and reuses the record
    engine.set_online(true);
    engine.drain_now().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let entries = engine.queue_entries().unwrap();
            if entries
                .iter()
                .any(|e| e.event.id == event.id && e.event.sync_status == SyncStatus::Synced)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event was not synced");

    let entry = engine.queue_entries().unwrap().pop().unwrap();
    assert_eq!(entry.event.server_id, Some(first_id));
    assert_eq!(server.stored_count().await, 1);

    engine.shutdown();
}
