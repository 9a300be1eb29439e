//! Per-backend control session handling.
//!
//! Each backend keeps one secure channel to the relay. The first stream it
//! opens is the control stream: register/refresh/delete requests flow as
//! length-framed bincode records and get a typed status back. Losing the
//! channel, for any reason, unregisters every lease the session owned.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use portal_common::protocol::{
    self, ControlRequest, ControlResponse, LeaseSpec, LeaseStatus, CONTROL_ALPN,
};
use portal_core::channel::SecureChannel;
use portal_core::framing::{read_record, write_record};
use portal_core::mux::{MuxHandle, MuxRole};
use portal_crypto::identity::{Credential, PortalId};

use crate::approval::ApprovalManager;
use crate::auth::AuthManager;
use crate::bandwidth::BandwidthManager;
use crate::config::RelayConfig;
use crate::conn_limit::ConnLimitManager;
use crate::ip_tracker::IpTracker;
use crate::registry::LeaseRegistry;
use crate::sni::SniRouter;

/// Everything a relay process shares across sessions and listeners.
pub struct RelayState {
    pub credential: Credential,
    pub config: RelayConfig,
    pub registry: Arc<LeaseRegistry>,
    pub approval: Arc<ApprovalManager>,
    pub bandwidth: Arc<BandwidthManager>,
    pub conn_limits: Arc<ConnLimitManager>,
    pub ip_tracker: Arc<IpTracker>,
    pub auth: Arc<AuthManager>,
    pub sni_router: Arc<SniRouter>,
}

impl RelayState {
    /// Build the managers from a config and wire the registry cleanup
    /// hooks (SNI routes and IP tracking follow lease destruction).
    pub fn new(credential: Credential, config: RelayConfig) -> Arc<Self> {
        let approval = Arc::new(ApprovalManager::new(config.approval_mode));
        let conn_limits = Arc::new(ConnLimitManager::new(config.default_conn_limit));
        let bandwidth = Arc::new(BandwidthManager::new(config.default_bps_limit));
        let ip_tracker = Arc::new(IpTracker::new(config.pending_ips_max));
        let auth = Arc::new(AuthManager::new(
            config.secret_key.clone(),
            config.max_failed_attempts,
            config.lock_duration,
            config.session_ttl,
        ));
        let sni_router = Arc::new(SniRouter::new());
        let registry = Arc::new(LeaseRegistry::new(
            config.lease_ttl,
            approval.clone(),
            conn_limits.clone(),
        ));

        {
            let sni_router = sni_router.clone();
            registry.add_unregister_hook(Box::new(move |id| {
                sni_router.unregister_by_lease(id);
            }));
        }
        {
            let ip_tracker = ip_tracker.clone();
            registry.add_unregister_hook(Box::new(move |id| {
                ip_tracker.remove_lease(id);
            }));
        }

        Arc::new(Self {
            credential,
            config,
            registry,
            approval,
            bandwidth,
            conn_limits,
            ip_tracker,
            auth,
            sni_router,
        })
    }

    /// The SNI host a lease is reachable at: explicit `sni` metadata, or
    /// `<name>.<sni_domain>` when a base domain is configured.
    fn sni_host_for(&self, spec: &LeaseSpec) -> Option<String> {
        if let Some(host) = spec.metadata.get("sni") {
            return Some(host.clone());
        }
        self.config
            .sni_domain
            .as_ref()
            .map(|domain| format!("{}.{}", spec.name.to_lowercase(), domain))
    }

    fn install_route(&self, holder: &PortalId, spec: &LeaseSpec) {
        if let Some(host) = self.sni_host_for(spec) {
            if !self.sni_router.register_route(holder.clone(), &host) {
                warn!(lease = %holder, %host, "lease name does not map to a valid sni route");
            }
        }
    }
}

/// Drive one backend connection to completion. Handshake failures close
/// the transport silently; no diagnostic reaches the wire.
pub async fn handle_backend(state: Arc<RelayState>, stream: TcpStream, peer: SocketAddr) {
    if state.ip_tracker.is_banned(&peer.ip()) {
        debug!(%peer, "dropping connection from banned IP");
        return;
    }
    state.ip_tracker.push_pending(peer.ip());

    let channel = match SecureChannel::accept(
        stream,
        &state.credential,
        &[CONTROL_ALPN.to_string()],
        state.config.handshake_timeout,
    )
    .await
    {
        Ok(channel) => channel,
        Err(e) => {
            debug!(%peer, "backend handshake failed: {e}");
            return;
        }
    };

    let holder = channel.remote_id().clone();
    info!(%peer, backend = %holder, "backend session established");

    let mux = MuxHandle::start(Arc::new(channel), MuxRole::Responder);
    let session = state.registry.allocate_session();

    let Some(mut control) = mux.accept_stream().await else {
        debug!(backend = %holder, "backend closed before opening control stream");
        return;
    };

    loop {
        let raw = match read_record(&mut control).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(backend = %holder, "control stream ended: {e}");
                break;
            }
        };
        let request: ControlRequest = match protocol::decode(&raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(backend = %holder, "malformed control request: {e}");
                break;
            }
        };

        let status = match request {
            ControlRequest::Register(spec) => {
                let status = state.registry.register(session, &mux, &holder, &spec);
                if status == LeaseStatus::Ok {
                    state.ip_tracker.register_lease_ip(holder.clone(), peer.ip());
                    state.install_route(&holder, &spec);
                }
                status
            }
            ControlRequest::Refresh(spec) => {
                let status = state.registry.refresh(session, &holder, &spec);
                if status == LeaseStatus::Ok {
                    // A refresh may have renamed the lease; keep the route
                    // aligned (registration dedups by lease).
                    state.install_route(&holder, &spec);
                }
                status
            }
            ControlRequest::Delete => state.registry.delete(session, &holder),
        };

        let response = ControlResponse { status };
        let encoded = match protocol::encode(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("control response encode failed: {e}");
                break;
            }
        };
        if let Err(e) = write_record(&mut control, &encoded).await {
            debug!(backend = %holder, "control write failed: {e}");
            break;
        }
    }

    let removed = state.registry.unregister_session(session);
    if !removed.is_empty() {
        info!(backend = %holder, leases = removed.len(), "session leases unregistered");
    }
    mux.close().await;
}
