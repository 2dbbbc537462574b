//! The remote ingestion contract
//!
//! The server is contractually required to treat the event's idempotency
//! key as a dedup key: a retried delivery of an already-stored event
//! returns `Duplicate` with the existing server id instead of creating a
//! second record. `Rejected` responses are terminal and are never retried
//! automatically.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SyncError;
use crate::types::{FieldEvent, IdempotencyKey};

/// Server response to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum IngestResponse {
    /// Stored; the server assigned this id
    Accepted { server_id: String },
    /// An event with this idempotency key was already stored
    Duplicate { server_id: String },
    /// The server refused the event (geofence violation, expired token, ...)
    Rejected { reason: String },
}

/// Client side of the ingestion endpoint
///
/// Transient transport failures are `Err(Network)`/`Err(Timeout)` and leave
/// the entry retryable; everything the server actually decided comes back
/// as an `IngestResponse`.
#[async_trait]
pub trait IngestionClient: Send + Sync {
    async fn deliver(&self, event: &FieldEvent) -> Result<IngestResponse, SyncError>;
}

/// In-memory ingestion server implementing the idempotency contract
///
/// Reference implementation for tests and the CLI demo: the first delivery
/// of a key is `Accepted`, every later delivery of the same key returns
/// `Duplicate` with the same server id.
#[derive(Default)]
pub struct MemoryIngestionServer {
    stored: Mutex<HashMap<IdempotencyKey, String>>,
}

impl MemoryIngestionServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct stored records
    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    /// Server id assigned to a key, if stored
    pub async fn server_id_for(&self, key: &IdempotencyKey) -> Option<String> {
        self.stored.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl IngestionClient for MemoryIngestionServer {
    async fn deliver(&self, event: &FieldEvent) -> Result<IngestResponse, SyncError> {
        let mut stored = self.stored.lock().await;

        if let Some(server_id) = stored.get(&event.idempotency_key) {
            debug!(key = %event.idempotency_key, %server_id, "Duplicate delivery");
            return Ok(IngestResponse::Duplicate {
                server_id: server_id.clone(),
            });
        }

        let server_id = format!("srv-{}", stored.len() + 1);
        stored.insert(event.idempotency_key, server_id.clone());
        Ok(IngestResponse::Accepted { server_id })
    }
}
