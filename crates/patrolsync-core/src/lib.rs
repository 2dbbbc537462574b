//! PatrolSync Core Library
//!
//! Offline-first presence verification for field security patrols.
//!
//! ## Overview
//!
//! Field agents prove physical presence at a location and time by scanning a
//! physical token (QR/NFC) or reporting GPS coordinates. Proof-events
//! propagate to a central store even when the device is intermittently
//! offline, then fan out to live dashboards.
//!
//! ## Core Principles
//!
//! - **Offline-first**: events captured without connectivity land in a
//!   durable local queue and drain when the device comes back online
//! - **Idempotent delivery**: every event carries a client-generated
//!   idempotency key; retries never create duplicate records
//! - **Synchronous rejection**: an invalid scan fails at scan time and is
//!   never queued or silently retried
//!
//! ## Quick Start
//!
//! ```ignore
//! use patrolsync_core::{EngineConfig, PatrolEngine, ScanMethod};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("~/.patrolsync/data", "guard-7", "site-1", device_info);
//!     let engine = PatrolEngine::new(config, registry, ingestion_client)?;
//!
//!     // Guard scans a checkpoint QR code
//!     let event = engine
//!         .checkpoint_visit("CHK-GATE", ScanMethod::Qr, location)
//!         .await?;
//!     println!("recorded {}", event.id);
//!
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod geofence;
pub mod logging;
pub mod queue;
pub mod realtime;
pub mod recorder;
pub mod sync;
pub mod types;
pub mod verify;

// Re-exports
pub use engine::{EngineConfig, LocationProvider, PatrolEngine};
pub use error::{
    DuplicateVisit, GeofenceError, PatrolError, PatrolResult, QueueError, RealtimeError, SyncError,
    VerificationError,
};
pub use queue::{OfflineQueue, MAX_SYNC_ATTEMPTS};
pub use realtime::{
    BroadcasterConfig, Category, ConnectionState, RealtimeBroadcaster, RealtimeConnection,
    RealtimeMessage, RealtimeTransport,
};
pub use recorder::{DedupWindow, EventRecorder, RecordRequest};
pub use sync::{IngestResponse, IngestionClient, MemoryIngestionServer, SyncConfig, SyncEngine, SyncEvent};
pub use types::*;
pub use verify::{MemoryTokenRegistry, TokenDescriptor, TokenRegistry, TokenVerifier};
