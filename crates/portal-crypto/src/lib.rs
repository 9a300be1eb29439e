//! Cryptographic primitives for Portal.
//!
//! This crate provides:
//! - Ed25519 credentials and derived Portal IDs
//! - X25519 static keys derived from the same signing seed
//! - Noise XX handshake with ALPN negotiation and identity binding
//!
//! # Design
//!
//! Uses the Noise XX pattern (`Noise_XX_25519_ChaChaPoly_BLAKE2s`) which
//! provides mutual authentication, identity hiding, and forward secrecy.
//! On top of XX, Portal binds each side's long-term Ed25519 identity to the
//! session by signing its own Noise static public key inside the encrypted
//! handshake payloads.
//!
//! The handshake yields a stateless transport so the framed channel above
//! can run independent nonce counters per direction.

#![forbid(unsafe_code)]

pub mod identity;
pub mod noise;

pub use identity::{Credential, Identity, PortalId};
pub use noise::{Established, Initiator, NoiseError, Responder};
