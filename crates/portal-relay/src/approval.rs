//! Lease approval state: auto mode admits everyone not denied, manual
//! mode admits only explicitly approved identities.

use std::collections::HashSet;
use std::sync::RwLock;

use portal_crypto::identity::PortalId;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    Auto,
    Manual,
}

impl ApprovalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// What the registry should do with a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allowed,
    Pending,
    Denied,
}

/// Concurrency-safe approval/denial sets. Invariant: the two sets are
/// disjoint; approving removes from denied and vice versa.
pub struct ApprovalManager {
    mode: RwLock<ApprovalMode>,
    approved: RwLock<HashSet<PortalId>>,
    denied: RwLock<HashSet<PortalId>>,
}

impl ApprovalManager {
    pub fn new(mode: ApprovalMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            approved: RwLock::new(HashSet::new()),
            denied: RwLock::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
        info!(?mode, "approval mode changed");
    }

    pub fn approve(&self, id: PortalId) {
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.approved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    pub fn deny(&self, id: PortalId) {
        self.approved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    /// Remove from the approved set only.
    pub fn revoke(&self, id: &PortalId) {
        self.approved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Remove from the denied set only.
    pub fn undeny(&self, id: &PortalId) {
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn is_approved(&self, id: &PortalId) -> bool {
        self.approved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    pub fn is_denied(&self, id: &PortalId) -> bool {
        self.denied
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Decide a registration: denial wins, then manual mode gates on the
    /// approved set.
    pub fn decide(&self, id: &PortalId) -> ApprovalDecision {
        if self.is_denied(id) {
            return ApprovalDecision::Denied;
        }
        match self.mode() {
            ApprovalMode::Auto => ApprovalDecision::Allowed,
            ApprovalMode::Manual => {
                if self.is_approved(id) {
                    ApprovalDecision::Allowed
                } else {
                    ApprovalDecision::Pending
                }
            }
        }
    }

    pub fn approved_snapshot(&self) -> Vec<PortalId> {
        self.approved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn denied_snapshot(&self) -> Vec<PortalId> {
        self.denied
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
