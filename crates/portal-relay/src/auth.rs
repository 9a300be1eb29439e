//! Operator authentication: secret-key checks, per-IP login lockout, and
//! opaque admin sessions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

/// Consecutive failures before an IP is locked.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 3;

/// Default lockout duration.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// Default admin session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct FailedLogin {
    attempts: u32,
    locked_at: Option<Instant>,
}

pub struct AuthManager {
    secret: Option<String>,
    max_failed: u32,
    lock_duration: Duration,
    session_ttl: Duration,
    failed: Mutex<HashMap<String, FailedLogin>>,
    sessions: Mutex<HashMap<String, Instant>>,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a_bytes.iter().zip(b_bytes.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

impl AuthManager {
    pub fn new(
        secret: Option<String>,
        max_failed: u32,
        lock_duration: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            max_failed: max_failed.max(1),
            lock_duration,
            session_ttl,
            failed: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_secret_key(&self) -> bool {
        self.secret.is_some()
    }

    /// Constant-time comparison against the configured secret. Always
    /// false when no secret is configured.
    pub fn validate_key(&self, key: &str) -> bool {
        match &self.secret {
            Some(secret) => constant_time_eq(secret, key),
            None => false,
        }
    }

    /// Record a failed login for `ip`. Returns `true` exactly when this
    /// failure locks the IP. An expired lock is cleared first, so the
    /// first failure after expiry starts a fresh count of one.
    pub fn record_failed_login(&self, ip: &str) -> bool {
        let mut failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failed.entry(ip.to_string()).or_insert(FailedLogin {
            attempts: 0,
            locked_at: None,
        });

        if let Some(locked_at) = entry.locked_at {
            if locked_at.elapsed() >= self.lock_duration {
                entry.attempts = 0;
                entry.locked_at = None;
            }
        }

        entry.attempts += 1;
        if entry.locked_at.is_none() && entry.attempts >= self.max_failed {
            entry.locked_at = Some(Instant::now());
            warn!(ip, attempts = entry.attempts, "IP locked out");
            return true;
        }
        false
    }

    pub fn is_ip_locked(&self, ip: &str) -> bool {
        let failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
        failed
            .get(ip)
            .and_then(|entry| entry.locked_at)
            .map(|locked_at| locked_at.elapsed() < self.lock_duration)
            .unwrap_or(false)
    }

    pub fn reset_failed_login(&self, ip: &str) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }

    /// Mint a fresh opaque session token, sweeping expired sessions on
    /// the way.
    pub fn create_session(&self) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        sessions.retain(|_, expires| *expires > now);
        sessions.insert(token.clone(), now + self.session_ttl);
        info!(active = sessions.len(), "admin session created");
        token
    }

    pub fn validate_session(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(token)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }

    /// No-op for the empty token.
    pub fn delete_session(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    #[cfg(test)]
    fn backdate_lock(&self, ip: &str, by: Duration) {
        let mut failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = failed.get_mut(ip) {
            if let Some(locked_at) = entry.locked_at {
                entry.locked_at = Some(locked_at - by);
            }
        }
    }

    #[cfg(test)]
    fn backdate_session(&self, token: &str, by: Duration) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(expires) = sessions.get_mut(token) {
            *expires -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(
            Some("super-secret".to_string()),
            DEFAULT_MAX_FAILED_ATTEMPTS,
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn key_validation_is_exact() {
        let auth = manager();
        assert!(auth.has_secret_key());
        assert!(auth.validate_key("super-secret"));
        assert!(!auth.validate_key("super-secret2"));
        assert!(!auth.validate_key(""));
    }

    #[test]
    fn no_secret_rejects_everything() {
        let auth = AuthManager::new(
            None,
            3,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(!auth.has_secret_key());
        assert!(!auth.validate_key(""));
        assert!(!auth.validate_key("anything"));
    }

    #[test]
    fn third_failure_locks() {
        let auth = manager();
        let ip = "203.0.113.42";

        assert!(!auth.record_failed_login(ip));
        assert!(!auth.record_failed_login(ip));
        assert!(auth.record_failed_login(ip));
        assert!(auth.is_ip_locked(ip));
    }

    #[test]
    fn expired_lock_does_not_immediately_relock() {
        let auth = manager();
        let ip = "203.0.113.42";

        for _ in 0..3 {
            auth.record_failed_login(ip);
        }
        assert!(auth.is_ip_locked(ip));

        // Push the lock past its expiry.
        auth.backdate_lock(ip, Duration::from_secs(61));
        assert!(!auth.is_ip_locked(ip));

        // First failure after expiry restarts the count at one.
        assert!(!auth.record_failed_login(ip));
        assert!(!auth.is_ip_locked(ip));
    }

    #[test]
    fn reset_clears_the_slate() {
        let auth = manager();
        let ip = "203.0.113.7";
        auth.record_failed_login(ip);
        auth.record_failed_login(ip);
        auth.reset_failed_login(ip);

        assert!(!auth.record_failed_login(ip));
        assert!(!auth.record_failed_login(ip));
        assert!(auth.record_failed_login(ip));
    }

    #[test]
    fn sessions_validate_until_expiry() {
        let auth = manager();
        let token = auth.create_session();
        assert!(auth.validate_session(&token));
        assert!(!auth.validate_session(""));
        assert!(!auth.validate_session("unknown"));

        auth.backdate_session(&token, Duration::from_secs(120));
        assert!(!auth.validate_session(&token));
    }

    #[test]
    fn delete_session_is_noop_for_empty() {
        let auth = manager();
        let token = auth.create_session();
        auth.delete_session("");
        assert!(auth.validate_session(&token));
        auth.delete_session(&token);
        assert!(!auth.validate_session(&token));
    }

    #[test]
    fn tokens_are_unique_and_opaque() {
        let auth = manager();
        let a = auth.create_session();
        let b = auth.create_session();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
