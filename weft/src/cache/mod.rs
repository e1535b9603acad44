//! Tenant-context cache: LRU keyed by the SHA-256 of the raw API key.
//!
//! The cache never sees the raw key; callers hash with [`hash_api_key`] and
//! pass the hex digest. LRU order moves on both reads and writes, capacity is
//! fixed (default 1000), and there is no TTL. Staleness is bounded only by
//! explicit invalidation: revoking a key invalidates by hash, deactivating a
//! tenant invalidates every entry for that tenant.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::tenant::TenantContext;

/// Default cache capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Hex SHA-256 digest of a raw API key; the only key form the gateway stores.
pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mutex-guarded LRU of resolved tenant contexts.
pub struct TenantCache {
    inner: Mutex<LruCache<String, TenantContext>>,
}

impl TenantCache {
    /// Cache with [`DEFAULT_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Cache with a custom capacity (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Looks up a context by key hash, promoting it to most-recently-used.
    pub fn get(&self, key_hash: &str) -> Option<TenantContext> {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("tenant cache lock failed (poisoned?): {}", e);
                return None;
            }
        };
        guard.get(key_hash).cloned()
    }

    /// Inserts or refreshes a context, evicting the least-recently-used entry
    /// when at capacity.
    pub fn set(&self, key_hash: String, context: TenantContext) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.put(key_hash, context);
        }
    }

    /// Drops the entry for one key hash (key revocation path).
    pub fn invalidate(&self, key_hash: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.pop(key_hash);
        }
    }

    /// Drops every entry resolved under `tenant_id` (tenant deactivation,
    /// config change anywhere in its chain).
    pub fn invalidate_all_for_tenant(&self, tenant_id: Uuid) {
        if let Ok(mut guard) = self.inner.lock() {
            let stale: Vec<String> = guard
                .iter()
                .filter(|(_, ctx)| ctx.tenant_id == tenant_id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                guard.pop(&key);
            }
        }
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// True when no contexts are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TenantCache {
    fn default() -> Self {
        Self::new()
    }
}
