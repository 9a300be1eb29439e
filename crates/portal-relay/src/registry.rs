//! Lease registry and dispatcher.
//!
//! A lease's only authoritative container is the secure channel that
//! registered it: entries are keyed by the holder's authenticated identity
//! and owned by the registering session. Closing that session atomically
//! unregisters every lease it held and fires the cleanup hooks (SNI route
//! removal lives there). Any persistent store would only ever be a cache.
//!
//! Registry operations never block on I/O; `open_stream` does I/O but
//! only after the entry handle has left the critical section.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use portal_common::protocol::{self, LeaseSpec, LeaseStatus, StreamAccept, StreamOffer};
use portal_core::framing::{read_record, write_record};
use portal_core::mux::{MuxHandle, MuxStream};
use portal_crypto::identity::PortalId;

use crate::approval::{ApprovalDecision, ApprovalManager};
use crate::conn_limit::ConnLimitManager;

/// Default lease TTL; missing refresh past this expires the lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

pub type SessionId = u64;

/// Wall-clock milliseconds since the epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A registered lease (snapshot form).
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: PortalId,
    pub name: String,
    pub alpns: Vec<String>,
    pub expires_unix_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Live registry entry: the lease plus its owning session's mux.
pub struct LeaseEntry {
    id: PortalId,
    owner: SessionId,
    mux: MuxHandle,
    lease: Mutex<Lease>,
    last_refresh: Mutex<Instant>,
}

impl LeaseEntry {
    pub fn id(&self) -> &PortalId {
        &self.id
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn name_key(&self) -> String {
        self.lease
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .name
            .to_lowercase()
    }

    fn touch(&self) {
        *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn stale(&self, ttl: Duration, now_ms: u64) -> bool {
        let refreshed = *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        if refreshed.elapsed() > ttl {
            return true;
        }
        let expires = self
            .lease
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .expires_unix_ms;
        expires <= now_ms
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connection limit exceeded")]
    LimitExceeded,

    #[error("lease channel closed")]
    ChannelClosed,

    #[error("backend refused the stream")]
    Refused,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Releases one admission slot on drop.
struct ConnPermit {
    id: PortalId,
    manager: Arc<ConnLimitManager>,
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}

/// A stream dispatched to a lease holder; dropping it releases the
/// connection-limit slot.
pub struct DispatchedStream {
    inner: MuxStream,
    _permit: ConnPermit,
}

impl std::fmt::Debug for DispatchedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedStream").finish_non_exhaustive()
    }
}

impl AsyncRead for DispatchedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DispatchedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<PortalId, Arc<LeaseEntry>>,
    by_name: HashMap<String, PortalId>,
}

type UnregisterHook = Box<dyn Fn(&PortalId) + Send + Sync>;

pub struct LeaseRegistry {
    inner: Mutex<Inner>,
    ttl: Duration,
    approval: Arc<ApprovalManager>,
    conn_limits: Arc<ConnLimitManager>,
    hooks: Mutex<Vec<UnregisterHook>>,
    next_session: AtomicU64,
}

/// URL-safe lease name: non-empty, letters/digits/underscore/dash.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

impl LeaseRegistry {
    pub fn new(
        ttl: Duration,
        approval: Arc<ApprovalManager>,
        conn_limits: Arc<ConnLimitManager>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            approval,
            conn_limits,
            hooks: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unique ID for a backend session; the owner key for its leases.
    pub fn allocate_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a cleanup hook fired with each unregistered lease ID.
    pub fn add_unregister_hook(&self, hook: UnregisterHook) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    fn fire_hooks(&self, ids: &[PortalId]) {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            for hook in hooks.iter() {
                hook(id);
            }
        }
    }

    fn validate(&self, holder: &PortalId, spec: &LeaseSpec) -> LeaseStatus {
        if !valid_name(&spec.name) || spec.alpns.is_empty() || spec.alpns.iter().any(|a| a.is_empty())
        {
            return LeaseStatus::InvalidName;
        }
        if spec.expires_unix_ms <= now_unix_ms() {
            return LeaseStatus::Expired;
        }
        match self.approval.decide(holder) {
            ApprovalDecision::Denied => LeaseStatus::Denied,
            ApprovalDecision::Pending => LeaseStatus::Unapproved,
            ApprovalDecision::Allowed => LeaseStatus::Ok,
        }
    }

    /// Register (or re-register on the same session) a lease for the
    /// authenticated holder.
    pub fn register(
        &self,
        session: SessionId,
        mux: &MuxHandle,
        holder: &PortalId,
        spec: &LeaseSpec,
    ) -> LeaseStatus {
        let status = self.validate(holder, spec);
        if status != LeaseStatus::Ok {
            return status;
        }

        let name_key = spec.name.to_lowercase();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // One lease per case-insensitive name.
        if let Some(existing_id) = inner.by_name.get(&name_key) {
            if existing_id != holder {
                return LeaseStatus::AlreadyInUse;
            }
        }
        // One lease per identity; only the owning session may replace it.
        if let Some(existing) = inner.by_id.get(holder) {
            if existing.owner != session {
                return LeaseStatus::AlreadyInUse;
            }
            let old_key = existing.name_key();
            if old_key != name_key {
                inner.by_name.remove(&old_key);
            }
        }

        let entry = Arc::new(LeaseEntry {
            id: holder.clone(),
            owner: session,
            mux: mux.clone(),
            lease: Mutex::new(Lease {
                id: holder.clone(),
                name: spec.name.clone(),
                alpns: spec.alpns.clone(),
                expires_unix_ms: spec.expires_unix_ms,
                metadata: spec.metadata.clone(),
            }),
            last_refresh: Mutex::new(Instant::now()),
        });

        inner.by_name.insert(name_key, holder.clone());
        inner.by_id.insert(holder.clone(), entry);
        info!(lease = %holder, name = %spec.name, "lease registered");
        LeaseStatus::Ok
    }

    /// Refresh the holder's lease. A changed name or ALPN set is an
    /// atomic update under the same collision rules; only the registering
    /// session may refresh.
    pub fn refresh(
        &self,
        session: SessionId,
        holder: &PortalId,
        spec: &LeaseSpec,
    ) -> LeaseStatus {
        let status = self.validate(holder, spec);
        if status != LeaseStatus::Ok {
            return status;
        }

        let name_key = spec.name.to_lowercase();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(entry) = inner.by_id.get(holder).cloned() else {
            // Nothing to refresh; the lease already expired.
            return LeaseStatus::Expired;
        };
        if entry.owner != session {
            return LeaseStatus::AlreadyInUse;
        }

        if let Some(existing_id) = inner.by_name.get(&name_key) {
            if existing_id != holder {
                return LeaseStatus::AlreadyInUse;
            }
        }

        let old_key = entry.name_key();
        if old_key != name_key {
            inner.by_name.remove(&old_key);
            inner.by_name.insert(name_key, holder.clone());
        }

        {
            let mut lease = entry.lease.lock().unwrap_or_else(|e| e.into_inner());
            lease.name = spec.name.clone();
            lease.alpns = spec.alpns.clone();
            lease.expires_unix_ms = spec.expires_unix_ms;
            lease.metadata = spec.metadata.clone();
        }
        entry.touch();
        debug!(lease = %holder, "lease refreshed");
        LeaseStatus::Ok
    }

    /// Delete the holder's lease. Idempotent; only the owner deletes.
    pub fn delete(&self, session: SessionId, holder: &PortalId) -> LeaseStatus {
        let removed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.by_id.get(holder) {
                Some(entry) if entry.owner == session => {
                    let key = entry.name_key();
                    inner.by_name.remove(&key);
                    inner.by_id.remove(holder);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.fire_hooks(std::slice::from_ref(holder));
            info!(lease = %holder, "lease deleted");
        }
        LeaseStatus::Ok
    }

    pub fn lookup_by_id(&self, id: &PortalId) -> Option<Arc<LeaseEntry>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .get(id)
            .cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<LeaseEntry>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.by_name.get(&name.to_lowercase())?;
        inner.by_id.get(id).cloned()
    }

    pub fn lease_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .len()
    }

    /// Remove every lease owned by `session`. Called when the backend's
    /// channel closes.
    pub fn unregister_session(&self, session: SessionId) -> Vec<PortalId> {
        let removed: Vec<PortalId> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<PortalId> = inner
                .by_id
                .iter()
                .filter(|(_, entry)| entry.owner == session)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(entry) = inner.by_id.remove(id) {
                    let key = entry.name_key();
                    inner.by_name.remove(&key);
                }
            }
            ids
        };

        for id in &removed {
            self.conn_limits.cleanup_lease(id);
            info!(lease = %id, "lease unregistered with session");
        }
        self.fire_hooks(&removed);
        removed
    }

    /// Drop leases whose refresh lapsed past the TTL or whose expiry
    /// passed. Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let now_ms = now_unix_ms();
        let removed: Vec<PortalId> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<PortalId> = inner
                .by_id
                .iter()
                .filter(|(_, entry)| entry.stale(self.ttl, now_ms))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(entry) = inner.by_id.remove(id) {
                    inner.by_name.remove(&entry.name_key());
                }
            }
            ids
        };

        if !removed.is_empty() {
            warn!(count = removed.len(), "swept expired leases");
            self.fire_hooks(&removed);
        }
        removed.len()
    }

    /// Open a fresh stream to the lease holder for an incoming client.
    /// Admission runs through the connection-limit manager; the offer /
    /// accept exchange happens on the new substream before any client
    /// bytes flow.
    pub async fn open_stream(
        &self,
        entry: &Arc<LeaseEntry>,
        peer_addr: &str,
        alpn: &str,
    ) -> Result<DispatchedStream, DispatchError> {
        if !self.conn_limits.try_acquire(&entry.id) {
            return Err(DispatchError::LimitExceeded);
        }
        let permit = ConnPermit {
            id: entry.id.clone(),
            manager: self.conn_limits.clone(),
        };

        let mut stream = entry
            .mux
            .open_stream()
            .map_err(|_| DispatchError::ChannelClosed)?;

        let offer = StreamOffer {
            lease_id: entry.id.to_string(),
            alpn: alpn.to_string(),
            peer_addr: peer_addr.to_string(),
        };
        let encoded =
            protocol::encode(&offer).map_err(|e| DispatchError::Protocol(e.to_string()))?;
        write_record(&mut stream, &encoded).await?;

        let raw = read_record(&mut stream).await?;
        let answer: StreamAccept =
            protocol::decode(&raw).map_err(|e| DispatchError::Protocol(e.to_string()))?;
        if !answer.ok {
            return Err(DispatchError::Refused);
        }

        Ok(DispatchedStream {
            inner: stream,
            _permit: permit,
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate_refresh(&self, id: &PortalId, by: Duration) {
        if let Some(entry) = self.lookup_by_id(id) {
            let mut refreshed = entry.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
            *refreshed -= by;
        }
    }
}
