//! Per-lease concurrent-connection limits.
//!
//! `try_acquire` admits or refuses atomically; `release` floors at zero.
//! A limit of zero means unlimited but the active count is still tracked
//! for observability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use portal_crypto::identity::PortalId;
use tracing::debug;

pub struct ConnLimitManager {
    default_limit: AtomicI64,
    overrides: RwLock<HashMap<PortalId, i64>>,
    active: RwLock<HashMap<PortalId, Arc<AtomicI64>>>,
}

impl ConnLimitManager {
    /// `default_limit == 0` means unlimited.
    pub fn new(default_limit: i64) -> Self {
        Self {
            default_limit: AtomicI64::new(default_limit.max(0)),
            overrides: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_default_limit(&self, limit: i64) {
        self.default_limit.store(limit.max(0), Ordering::Relaxed);
    }

    pub fn set_limit(&self, id: &PortalId, limit: i64) {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), limit.max(0));
    }

    pub fn effective_limit(&self, id: &PortalId) -> i64 {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or_else(|| self.default_limit.load(Ordering::Relaxed))
    }

    fn counter(&self, id: &PortalId) -> Arc<AtomicI64> {
        {
            let active = self.active.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = active.get(id) {
                return counter.clone();
            }
        }
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        active
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    /// Atomically admit one connection, or refuse if the lease is at its
    /// limit.
    pub fn try_acquire(&self, id: &PortalId) -> bool {
        let limit = self.effective_limit(id);
        let counter = self.counter(id);

        let admitted = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if limit != 0 && cur >= limit {
                    None
                } else {
                    Some(cur + 1)
                }
            })
            .is_ok();

        if !admitted {
            debug!(lease = %id, limit, "connection refused: at limit");
        }
        admitted
    }

    /// Release one connection. Floors at zero; releasing more than was
    /// acquired never drives the count negative.
    pub fn release(&self, id: &PortalId) {
        let counter = self.counter(id);
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((cur - 1).max(0))
        });
    }

    pub fn active_count(&self, id: &PortalId) -> i64 {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Forget both the override and the counter for a lease.
    pub fn cleanup_lease(&self, id: &PortalId) {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_crypto::identity::Credential;

    fn id() -> PortalId {
        Credential::generate().id()
    }

    #[test]
    fn override_beats_default() {
        let mgr = ConnLimitManager::new(10);
        let lease = id();
        mgr.set_limit(&lease, 2);
        assert_eq!(mgr.effective_limit(&lease), 2);
        assert_eq!(mgr.effective_limit(&id()), 10);
    }

    #[test]
    fn acquire_respects_limit_and_release_reopens() {
        let mgr = ConnLimitManager::new(0);
        let lease = id();
        mgr.set_limit(&lease, 2);

        let admitted: Vec<bool> = (0..10).map(|_| mgr.try_acquire(&lease)).collect();
        assert_eq!(admitted.iter().filter(|&&ok| ok).count(), 2);
        assert_eq!(mgr.active_count(&lease), 2);

        mgr.release(&lease);
        mgr.release(&lease);
        assert!(mgr.try_acquire(&lease));
        assert!(mgr.try_acquire(&lease));
        assert!(!mgr.try_acquire(&lease));
    }

    #[test]
    fn unlimited_still_tracks_active_count() {
        let mgr = ConnLimitManager::new(0);
        let lease = id();
        for _ in 0..5 {
            assert!(mgr.try_acquire(&lease));
        }
        assert_eq!(mgr.active_count(&lease), 5);
    }

    #[test]
    fn release_floors_at_zero() {
        let mgr = ConnLimitManager::new(0);
        let lease = id();
        mgr.release(&lease);
        mgr.release(&lease);
        assert_eq!(mgr.active_count(&lease), 0);
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let mgr = Arc::new(ConnLimitManager::new(0));
        let lease = id();
        mgr.set_limit(&lease, 3);
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            let lease = lease.clone();
            let admitted = admitted.clone();
            handles.push(thread::spawn(move || {
                if mgr.try_acquire(&lease) {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.active_count(&lease), 3);
    }

    #[test]
    fn cleanup_forgets_limit_and_count() {
        let mgr = ConnLimitManager::new(0);
        let lease = id();
        mgr.set_limit(&lease, 1);
        assert!(mgr.try_acquire(&lease));

        mgr.cleanup_lease(&lease);
        assert_eq!(mgr.active_count(&lease), 0);
        assert_eq!(mgr.effective_limit(&lease), 0);
        assert!(mgr.try_acquire(&lease));
    }
}
