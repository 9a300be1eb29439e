//! Control-message protocol between a lease holder and the relay.
//!
//! Control messages travel as bincode records over the backend's secure
//! channel (stream 0 of the multiplexer); each dispatched client stream
//! starts with a [`StreamOffer`] / [`StreamAccept`] exchange before raw
//! bytes flow. The holder's identity never appears in these payloads; it
//! comes from the channel's authenticated remote ID.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ALPN tag for backend control channels.
pub const CONTROL_ALPN: &str = "portal/ctl/1";

/// A lease as requested by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSpec {
    /// Human-facing endpoint name; unique case-insensitively.
    pub name: String,
    /// ALPN tags clients must match to reach this lease. Never empty.
    pub alpns: Vec<String>,
    /// Expiry as unix milliseconds. Must be in the future at registration.
    pub expires_unix_ms: u64,
    /// Free-form metadata surfaced to operators.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Requests sent by the lease holder on the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Register a new lease on this channel.
    Register(LeaseSpec),
    /// Refresh (and possibly atomically update) the lease on this channel.
    Refresh(LeaseSpec),
    /// Delete the lease. Idempotent.
    Delete,
}

/// Typed rejection codes surfaced to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Ok,
    AlreadyInUse,
    InvalidName,
    Unapproved,
    Denied,
    Expired,
    LimitExceeded,
    Internal,
}

/// Responses from the relay on the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: LeaseStatus,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            status: LeaseStatus::Ok,
        }
    }

    pub fn rejected(status: LeaseStatus) -> Self {
        Self { status }
    }

    pub fn is_ok(&self) -> bool {
        self.status == LeaseStatus::Ok
    }
}

/// First record on every dispatched client stream, relay -> holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOffer {
    /// ID of the lease the client was routed to.
    pub lease_id: String,
    /// ALPN the client matched (or the lease's primary tag for raw SNI).
    pub alpn: String,
    /// Client address as observed by the relay.
    pub peer_addr: String,
}

/// Holder's answer to a [`StreamOffer`]. A decline tears the stream down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAccept {
    pub ok: bool,
}

/// Serialize a control record for the wire.
pub fn encode<T: Serialize>(msg: &T) -> crate::error::Result<Vec<u8>> {
    bincode::serialize(msg).map_err(crate::error::Error::serialization)
}

/// Deserialize a control record from the wire.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> crate::error::Result<T> {
    bincode::deserialize(bytes).map_err(crate::error::Error::serialization)
}
