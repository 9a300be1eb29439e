//! Portal relay: lease registry, per-lease managers, SNI ingress, and the
//! relay establisher.
//!
//! Backends hold one secure channel each and register leases over it;
//! clients arrive over raw TCP, get routed by SNI, and are relayed through
//! a fresh substream to the lease holder. The live channel is the only
//! authoritative home of a lease.

#![forbid(unsafe_code)]

pub mod approval;
pub mod auth;
pub mod bandwidth;
pub mod config;
pub mod conn_limit;
pub mod forward;
pub mod ip_tracker;
pub mod registry;
pub mod session;
pub mod sni;

pub use config::RelayConfig;
pub use registry::LeaseRegistry;
pub use session::{handle_backend, RelayState};
