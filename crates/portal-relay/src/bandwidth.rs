//! Per-lease byte-rate limits.
//!
//! One token bucket per limited lease, shared across every connection
//! relayed for it. Changing a limit drops the old bucket; the next
//! `get_bucket` builds a fresh one, so bucket identity is not preserved
//! across limit changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use portal_core::limiter::TokenBucket;
use portal_crypto::identity::PortalId;
use tracing::info;

pub struct BandwidthManager {
    default_bps: AtomicI64,
    limits: RwLock<HashMap<PortalId, i64>>,
    buckets: RwLock<HashMap<PortalId, Arc<TokenBucket>>>,
}

impl BandwidthManager {
    /// `default_bps <= 0` means unlimited by default.
    pub fn new(default_bps: i64) -> Self {
        Self {
            default_bps: AtomicI64::new(default_bps),
            limits: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_bps(&self) -> i64 {
        self.default_bps.load(Ordering::Relaxed)
    }

    pub fn set_default_bps(&self, rate: i64) {
        self.default_bps.store(rate, Ordering::Relaxed);
    }

    /// Set a per-lease limit. Non-positive clears the limit and drops any
    /// bucket.
    pub fn set_bps_limit(&self, id: &PortalId, rate: i64) {
        if rate <= 0 {
            self.limits
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
            self.buckets
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
            info!(lease = %id, "bandwidth limit cleared");
            return;
        }

        self.limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), rate);
        // Existing bucket carries the old rate; rebuild lazily.
        self.buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(lease = %id, rate, "bandwidth limit set");
    }

    /// Effective limit for a lease: per-lease override or the default.
    pub fn effective_limit(&self, id: &PortalId) -> i64 {
        self.limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or_else(|| self.default_bps())
    }

    /// Get the bucket for a lease, lazily creating one when a positive
    /// limit applies. `None` means unlimited.
    pub fn get_bucket(&self, id: &PortalId) -> Option<Arc<TokenBucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = buckets.get(id) {
                return Some(bucket.clone());
            }
        }

        let rate = self.effective_limit(id);
        let bucket = TokenBucket::new(rate, rate)?;

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        // A racing creator may have beaten us; keep the first.
        Some(
            buckets
                .entry(id.clone())
                .or_insert(bucket)
                .clone(),
        )
    }

    /// Forget everything about a lease.
    pub fn cleanup_lease(&self, id: &PortalId) {
        self.limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}
