//! Token verification against the external registry
//!
//! The registry itself (storage, admin screens, indexing) lives outside the
//! core; this module defines the contract the core needs from it and the
//! verifier that applies the validation rules:
//!
//! - lookup by exact code, then by NFC tag identifier — both indexed, there
//!   is no scan-and-filter fallback
//! - expiry takes precedence over the usage limit
//! - checkpoint tokens with no expiry are permanent
//! - validation never mutates `usage_count`; incrementing is a separate
//!   explicit call made only after the associated event was accepted, so a
//!   rejected scan never consumes token usage

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::VerificationError;
use crate::types::{CheckpointDefinition, CheckpointId, TokenKind, VerificationToken};

/// Contract the core requires from the token registry
///
/// `lookup` and `lookup_by_nfc` are both index-backed on the registry side.
/// `increment_usage` must be a single atomic increment (for a SQL-backed
/// registry, one `UPDATE ... SET usage_count = usage_count + 1`).
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Look up a token by its exact code
    async fn lookup(&self, code: &str) -> Result<Option<VerificationToken>, VerificationError>;

    /// Look up a token by its NFC tag identifier
    async fn lookup_by_nfc(
        &self,
        tag_id: &str,
    ) -> Result<Option<VerificationToken>, VerificationError>;

    /// Fetch a checkpoint definition by id
    async fn checkpoint(
        &self,
        id: &CheckpointId,
    ) -> Result<Option<CheckpointDefinition>, VerificationError>;

    /// All checkpoints for a site (used for nearest-checkpoint attachment)
    async fn checkpoints_for_site(
        &self,
        site_id: &str,
    ) -> Result<Vec<CheckpointDefinition>, VerificationError>;

    /// Record one accepted use of the token. Atomic single increment;
    /// called only after the associated field event was accepted.
    async fn increment_usage(&self, code: &str) -> Result<(), VerificationError>;
}

/// A validated token, as handed to the event recorder
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDescriptor {
    pub code: String,
    pub kind: TokenKind,
    /// Checkpoint the token is bound to, if any
    pub checkpoint_id: Option<CheckpointId>,
}

/// Validates scanned codes against the token registry
pub struct TokenVerifier<R: TokenRegistry> {
    registry: Arc<R>,
}

impl<R: TokenRegistry> TokenVerifier<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self { registry }
    }

    /// Validate a scanned code at `now_ms`
    ///
    /// Lookup order: exact code match, then NFC tag identifier match.
    /// Check order on a found token: active, validity window (expiry wins
    /// over usage limit), usage limit.
    pub async fn validate(
        &self,
        code: &str,
        now_ms: i64,
    ) -> Result<TokenDescriptor, VerificationError> {
        let token = match self.registry.lookup(code).await? {
            Some(token) => token,
            None => match self.registry.lookup_by_nfc(code).await? {
                Some(token) => token,
                None => {
                    debug!(code, "No token matched code or NFC tag");
                    return Err(VerificationError::NotFound(code.to_string()));
                }
            },
        };

        // Expiry first: an expired token is never valid regardless of
        // `active` or remaining usage.
        if token.expired(now_ms) {
            return Err(VerificationError::Expired(token.code));
        }
        if !token.active {
            return Err(VerificationError::InvalidCode(format!(
                "token {} is inactive",
                token.code
            )));
        }
        if !token.time_valid(now_ms) {
            return Err(VerificationError::InvalidCode(format!(
                "token {} is not yet valid",
                token.code
            )));
        }
        if token.usage_exhausted() {
            return Err(VerificationError::UsageLimitReached(token.code));
        }

        debug!(code = %token.code, kind = ?token.kind, "Token validated");
        Ok(TokenDescriptor {
            code: token.code,
            kind: token.kind,
            checkpoint_id: token.checkpoint_id,
        })
    }
}

/// In-memory token registry
///
/// Reference implementation of the registry contract, used by tests and the
/// CLI demo. Lookups are indexed (a code map and an NFC tag map), and
/// `increment_usage` runs under a single write lock so concurrent accepts
/// each count exactly once.
#[derive(Default)]
pub struct MemoryTokenRegistry {
    inner: RwLock<MemoryRegistryInner>,
}

#[derive(Default)]
struct MemoryRegistryInner {
    tokens: HashMap<String, VerificationToken>,
    /// NFC tag id -> token code
    nfc_index: HashMap<String, String>,
    checkpoints: HashMap<CheckpointId, CheckpointDefinition>,
}

impl MemoryTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token, indexing its NFC tag if present
    pub fn insert_token(&self, token: VerificationToken) {
        let mut inner = self.inner.write();
        if let Some(tag) = &token.nfc_tag_id {
            inner.nfc_index.insert(tag.clone(), token.code.clone());
        }
        inner.tokens.insert(token.code.clone(), token);
    }

    /// Register a checkpoint definition
    pub fn insert_checkpoint(&self, checkpoint: CheckpointDefinition) {
        self.inner
            .write()
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint);
    }

    /// Current usage count for a token, for assertions and operator views
    pub fn usage_count(&self, code: &str) -> Option<u32> {
        self.inner.read().tokens.get(code).map(|t| t.usage_count)
    }
}

#[async_trait]
impl TokenRegistry for MemoryTokenRegistry {
    async fn lookup(&self, code: &str) -> Result<Option<VerificationToken>, VerificationError> {
        Ok(self.inner.read().tokens.get(code).cloned())
    }

    async fn lookup_by_nfc(
        &self,
        tag_id: &str,
    ) -> Result<Option<VerificationToken>, VerificationError> {
        let inner = self.inner.read();
        Ok(inner
            .nfc_index
            .get(tag_id)
            .and_then(|code| inner.tokens.get(code))
            .cloned())
    }

    async fn checkpoint(
        &self,
        id: &CheckpointId,
    ) -> Result<Option<CheckpointDefinition>, VerificationError> {
        Ok(self.inner.read().checkpoints.get(id).cloned())
    }

    async fn checkpoints_for_site(
        &self,
        site_id: &str,
    ) -> Result<Vec<CheckpointDefinition>, VerificationError> {
        Ok(self
            .inner
            .read()
            .checkpoints
            .values()
            .filter(|c| c.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn increment_usage(&self, code: &str) -> Result<(), VerificationError> {
        let mut inner = self.inner.write();
        let token = inner
            .tokens
            .get_mut(code)
            .ok_or_else(|| VerificationError::NotFound(code.to_string()))?;
        token.usage_count += 1;
        Ok(())
    }
}
