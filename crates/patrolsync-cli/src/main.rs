//! PatrolSync CLI
//!
//! Thin wrapper around patrolsync-core for queue inspection and an
//! in-process pipeline demo.
//!
//! ## Usage
//!
//! ```bash
//! # Queue counts by status
//! patrolsync queue stats
//!
//! # List queued events
//! patrolsync queue list
//!
//! # Return failed entries to pending with a fresh attempt budget
//! patrolsync queue reset-failed
//!
//! # Run the full pipeline in-process against in-memory services
//! patrolsync demo
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use patrolsync_core::queue::{OfflineQueue, MAX_SYNC_ATTEMPTS};
use patrolsync_core::realtime::{channel_transport, BroadcasterConfig, RealtimeBroadcaster};
use patrolsync_core::sync::MemoryIngestionServer;
use patrolsync_core::types::{
    now_ms, CapturedLocation, CheckpointDefinition, CheckpointId, DeviceInfo, GeoPoint, ScanMethod,
    SyncStatus, TokenKind, VerificationToken,
};
use patrolsync_core::verify::MemoryTokenRegistry;
use patrolsync_core::{EngineConfig, PatrolEngine};

/// PatrolSync - offline-first presence verification for field patrols
#[derive(Parser)]
#[command(name = "patrolsync")]
#[command(version = "0.1.0")]
#[command(about = "PatrolSync - offline-first presence verification")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.patrolsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offline queue inspection and recovery
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run the scan -> queue -> sync -> republish pipeline in-process
    Demo,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show counts by status
    Stats,
    /// List all queued events
    List,
    /// Clear attempts and errors on failed entries
    ResetFailed,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.patrolsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".patrolsync")
        .join("data")
}

fn open_queue(data_dir: &PathBuf) -> Result<OfflineQueue> {
    Ok(OfflineQueue::open(data_dir.join("patrolsync.redb"))?)
}

fn cmd_queue_stats(data_dir: &PathBuf) -> Result<()> {
    let queue = open_queue(data_dir)?;
    let stats = queue.stats()?;

    println!("Queue ({} entries)", stats.total());
    println!("  pending: {}", stats.pending);
    println!("  syncing: {}", stats.syncing);
    println!("  synced:  {}", stats.synced);
    println!("  failed:  {}", stats.failed);
    if let Some(oldest) = stats.oldest_pending_ms {
        let age_secs = (now_ms() - oldest) / 1000;
        println!("  oldest pending: {}s ago", age_secs);
    }
    Ok(())
}

fn cmd_queue_list(data_dir: &PathBuf) -> Result<()> {
    let queue = open_queue(data_dir)?;
    let entries = queue.entries()?;

    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for entry in entries {
        let e = &entry.event;
        println!("{} [{}] {}", e.id, e.sync_status, e.kind);
        println!("  actor: {}", e.actor_id);
        if let Some(checkpoint) = &e.checkpoint_id {
            println!("  checkpoint: {}", checkpoint);
        }
        if let Some(server_id) = &e.server_id {
            println!("  server id: {}", server_id);
        }
        if e.sync_attempts > 0 {
            println!("  attempts: {}/{}", e.sync_attempts, MAX_SYNC_ATTEMPTS);
        }
        if let Some(error) = &e.last_error {
            println!("  last error: {}", error);
        }
    }
    Ok(())
}

fn cmd_queue_reset_failed(data_dir: &PathBuf) -> Result<()> {
    let queue = open_queue(data_dir)?;
    let reset = queue.reset_failed()?;
    println!("Reset {} failed entries to pending", reset);
    Ok(())
}

/// Run the whole pipeline in-process: a seeded registry, an in-memory
/// ingestion server and an echoing realtime endpoint.
async fn cmd_demo(data_dir: &PathBuf) -> Result<()> {
    let registry = Arc::new(MemoryTokenRegistry::new());
    registry.insert_checkpoint(CheckpointDefinition {
        id: CheckpointId::new("cp-gate"),
        site_id: "demo-site".into(),
        center: GeoPoint::new(51.5000, -0.1200),
        radius_meters: 50.0,
        allowed_methods: vec![ScanMethod::Qr, ScanMethod::Nfc],
    });
    registry.insert_token(VerificationToken {
        code: "CHK-GATE".into(),
        nfc_tag_id: None,
        kind: TokenKind::Checkpoint,
        valid_from_ms: 0,
        valid_until_ms: None,
        usage_limit: None,
        usage_count: 0,
        active: true,
        checkpoint_id: Some(CheckpointId::new("cp-gate")),
    });

    let server = Arc::new(MemoryIngestionServer::new());
    let config = EngineConfig::new(
        data_dir.join("demo"),
        "guard-demo",
        "demo-site",
        DeviceInfo {
            device_id: "demo-device".into(),
            platform: std::env::consts::OS.into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        },
    );
    let engine = PatrolEngine::new(config, registry.clone(), server.clone())?;

    // Dashboard channel: the in-memory endpoint echoes confirmed messages
    let (transport, mut accept_rx) = channel_transport();
    let broadcaster = RealtimeBroadcaster::new(
        Arc::new(transport),
        BroadcasterConfig::new("demo-org", "guard-demo"),
    );
    let mut dashboard = broadcaster.subscribe();
    let _mirror = broadcaster.mirror_sync_events(engine.subscribe_sync_events());
    let _channel = broadcaster.start();

    let mut endpoint = accept_rx
        .recv()
        .await
        .context("realtime transport did not connect")?;
    tokio::spawn(async move {
        while let Some(text) = endpoint.from_client.recv().await {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
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

    println!("1. Device offline; guard scans checkpoint 30m from its center");
    engine.set_online(false);
    let location = CapturedLocation::new(51.5000, -0.11957, 8.0);
    let event = engine
        .checkpoint_visit("CHK-GATE", ScanMethod::Qr, location)
        .await?;
    println!("   recorded {} ({})", event.id, event.kind);

    let stats = engine.queue_stats()?;
    println!("   queue: {} pending, {} synced", stats.pending, stats.synced);

    println!("2. Device back online; queue drains");
    engine.set_online(true);
    engine.drain_now().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let entry = engine
        .queue_entries()?
        .into_iter()
        .find(|e| e.event.id == event.id)
        .context("queued entry disappeared")?;
    anyhow::ensure!(
        entry.event.sync_status == SyncStatus::Synced,
        "entry did not sync"
    );
    println!(
        "   synced as {} (usage count now {:?})",
        entry.event.server_id.as_deref().unwrap_or("?"),
        registry.usage_count("CHK-GATE")
    );

    println!("3. Dashboard receives the republished confirmation");
    let message = tokio::time::timeout(Duration::from_secs(5), dashboard.recv()).await??;
    println!(
        "   [{}] {} -> {}",
        message.category, message.action, message.data["serverId"]
    );

    broadcaster.shutdown();
    engine.shutdown();
    println!("Demo complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Queue { action } => match action {
            QueueAction::Stats => cmd_queue_stats(&data_dir)?,
            QueueAction::List => cmd_queue_list(&data_dir)?,
            QueueAction::ResetFailed => cmd_queue_reset_failed(&data_dir)?,
        },
        Commands::Demo => cmd_demo(&data_dir).await?,
    }

    Ok(())
}
