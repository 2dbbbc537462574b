//! Queue draining and delivery to the ingestion endpoint
//!
//! The sync engine drains the offline queue to the remote ingestion
//! contract one entry at a time, with single-flight drains, attempt-capped
//! retry, and cooperative cancellation on connectivity loss.

mod engine;
mod events;
mod ingest;

pub use engine::{SyncConfig, SyncEngine};
pub use events::SyncEvent;
pub use ingest::{IngestResponse, IngestionClient, MemoryIngestionServer};
