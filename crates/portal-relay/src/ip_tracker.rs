//! IP bookkeeping: bans, lease-to-IP mapping, and the pending-IP queue.
//!
//! The forward map (lease → IP) and reverse index (IP → leases) move
//! together: registering a lease at a new IP removes the stale reverse
//! entry for its previous IP.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};

use portal_crypto::identity::PortalId;
use tracing::info;

/// Default cap on the recently-seen IP queue.
pub const DEFAULT_PENDING_IPS_MAX: usize = 100;

pub struct IpTracker {
    banned: RwLock<HashSet<IpAddr>>,
    lease_ip: RwLock<HashMap<PortalId, IpAddr>>,
    ip_leases: RwLock<HashMap<IpAddr, HashSet<PortalId>>>,
    pending: Mutex<VecDeque<IpAddr>>,
    pending_max: usize,
}

impl IpTracker {
    pub fn new(pending_max: usize) -> Self {
        Self {
            banned: RwLock::new(HashSet::new()),
            lease_ip: RwLock::new(HashMap::new()),
            ip_leases: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_max: pending_max.max(1),
        }
    }

    pub fn ban(&self, ip: IpAddr) {
        self.banned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip);
        info!(%ip, "IP banned");
    }

    pub fn unban(&self, ip: &IpAddr) {
        self.banned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ip)
    }

    pub fn banned_snapshot(&self) -> Vec<IpAddr> {
        self.banned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Record that `lease` currently lives at `ip`, moving the reverse
    /// index if the lease migrated.
    pub fn register_lease_ip(&self, lease: PortalId, ip: IpAddr) {
        let previous = {
            let mut forward = self.lease_ip.write().unwrap_or_else(|e| e.into_inner());
            forward.insert(lease.clone(), ip)
        };

        let mut reverse = self.ip_leases.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old_ip) = previous {
            if old_ip != ip {
                if let Some(set) = reverse.get_mut(&old_ip) {
                    set.remove(&lease);
                    if set.is_empty() {
                        reverse.remove(&old_ip);
                    }
                }
            }
        }
        reverse.entry(ip).or_default().insert(lease);
    }

    /// Forget a lease entirely.
    pub fn remove_lease(&self, lease: &PortalId) {
        let previous = {
            let mut forward = self.lease_ip.write().unwrap_or_else(|e| e.into_inner());
            forward.remove(lease)
        };
        if let Some(ip) = previous {
            let mut reverse = self.ip_leases.write().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = reverse.get_mut(&ip) {
                set.remove(lease);
                if set.is_empty() {
                    reverse.remove(&ip);
                }
            }
        }
    }

    pub fn lease_ip(&self, lease: &PortalId) -> Option<IpAddr> {
        self.lease_ip
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(lease)
            .copied()
    }

    pub fn ip_leases(&self, ip: &IpAddr) -> Vec<PortalId> {
        self.ip_leases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push onto the bounded recently-seen queue, dropping the oldest on
    /// overflow.
    pub fn push_pending(&self, ip: IpAddr) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.len() >= self.pending_max {
            pending.pop_front();
        }
        pending.push_back(ip);
    }

    pub fn pending_snapshot(&self) -> Vec<IpAddr> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }
}

/// Resolve the client IP from forwarding headers, in order: the first
/// token of `X-Forwarded-For`, then `X-Real-IP`, then the host part of
/// the remote address (falling back to the raw string).
pub fn extract_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: &str,
) -> String {
    if let Some(xff) = forwarded_for {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real) = real_ip {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }

    match remote_addr.parse::<std::net::SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => remote_addr.to_string(),
    }
}
