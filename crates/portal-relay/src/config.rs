//! Relay configuration: defaults, environment knobs, CLI overrides.
//!
//! Flags beat environment, environment beats defaults. Environment names
//! are all `PORTAL_*`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::approval::ApprovalMode;
use crate::auth::{DEFAULT_LOCK_DURATION, DEFAULT_MAX_FAILED_ATTEMPTS, DEFAULT_SESSION_TTL};
use crate::ip_tracker::DEFAULT_PENDING_IPS_MAX;
use crate::registry::DEFAULT_LEASE_TTL;

pub const DEFAULT_CONTROL_LISTEN: &str = "0.0.0.0:7000";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where backends dial in for control channels.
    pub control_listen: SocketAddr,
    /// Optional raw-TLS ingress routed by SNI.
    pub sni_listen: Option<SocketAddr>,
    /// Base domain for implicit `<lease-name>.<domain>` SNI routes.
    pub sni_domain: Option<String>,
    pub approval_mode: ApprovalMode,
    pub secret_key: Option<String>,
    pub max_failed_attempts: u32,
    pub lock_duration: Duration,
    pub session_ttl: Duration,
    pub default_conn_limit: i64,
    pub default_bps_limit: i64,
    pub pending_ips_max: usize,
    pub lease_ttl: Duration,
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_listen: DEFAULT_CONTROL_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7000))),
            sni_listen: None,
            sni_domain: None,
            approval_mode: ApprovalMode::Auto,
            secret_key: None,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lock_duration: DEFAULT_LOCK_DURATION,
            session_ttl: DEFAULT_SESSION_TTL,
            default_conn_limit: 0,
            default_bps_limit: 0,
            pending_ips_max: DEFAULT_PENDING_IPS_MAX,
            lease_ttl: DEFAULT_LEASE_TTL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with the `PORTAL_*` environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(listen) = env_str("PORTAL_CONTROL_LISTEN") {
            if let Ok(addr) = listen.parse() {
                config.control_listen = addr;
            }
        }
        if let Some(listen) = env_str("PORTAL_SNI_LISTEN") {
            config.sni_listen = listen.parse().ok();
        }
        config.sni_domain = env_str("PORTAL_SNI_DOMAIN");

        if let Some(mode) = env_str("PORTAL_APPROVAL_MODE").and_then(|m| ApprovalMode::parse(&m)) {
            config.approval_mode = mode;
        }
        config.secret_key = env_str("PORTAL_SECRET_KEY");

        config.max_failed_attempts = env_u64(
            "PORTAL_MAX_FAILED_ATTEMPTS",
            DEFAULT_MAX_FAILED_ATTEMPTS as u64,
        ) as u32;
        config.lock_duration = Duration::from_secs(env_u64(
            "PORTAL_LOCK_DURATION_SECS",
            DEFAULT_LOCK_DURATION.as_secs(),
        ));
        config.session_ttl = Duration::from_secs(env_u64(
            "PORTAL_SESSION_TTL_SECS",
            DEFAULT_SESSION_TTL.as_secs(),
        ));
        config.default_conn_limit = env_i64("PORTAL_DEFAULT_CONN_LIMIT", 0);
        config.default_bps_limit = env_i64("PORTAL_DEFAULT_BPS_LIMIT", 0);
        config.pending_ips_max =
            env_u64("PORTAL_PENDING_IPS_MAX", DEFAULT_PENDING_IPS_MAX as u64) as usize;
        config.lease_ttl = Duration::from_secs(env_u64(
            "PORTAL_LEASE_TTL_SECS",
            DEFAULT_LEASE_TTL.as_secs(),
        ));
        config.handshake_timeout = Duration::from_secs(env_u64(
            "PORTAL_HANDSHAKE_TIMEOUT_SECS",
            DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        ));

        config
    }
}
