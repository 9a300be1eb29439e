//! Ed25519 credentials and Portal IDs.
//!
//! A **Portal ID** is derived from the Ed25519 public key by a keyed,
//! truncated SHA-256: the first 16 bytes of
//! `HMAC-SHA256(key = "RDVERB_PROTOCOL_VER_01_SHA256_ID", public_key)`,
//! base32-encoded (RFC 4648 alphabet, no padding) into 26 characters.
//! The keyed hash keeps IDs stable across protocol revisions while making
//! them useless as raw key material.
//!
//! The same 32-byte signing seed also yields the X25519 static key used by
//! the Noise handshake: SHA-512 over the seed, first 32 bytes clamped per
//! RFC 7748. Deriving both keys from one seed means a peer stores exactly
//! one secret.
//!
//! # Example
//!
//! ```
//! use portal_crypto::identity::Credential;
//!
//! let cred = Credential::generate();
//! let id = cred.id();
//! assert_eq!(id.as_str().len(), 26);
//!
//! let sig = cred.sign(b"challenge");
//! assert!(cred.verify(b"challenge", &sig));
//! ```

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Keyed-hash domain for ID derivation. Changing this breaks every
/// published ID, so it is versioned in-band.
const ID_DERIVATION_KEY: &[u8] = b"RDVERB_PROTOCOL_VER_01_SHA256_ID";

const BASE32_NO_PAD: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// Portal ID: 26-character base32 digest of an Ed25519 public key.
///
/// This is the primary peer identifier in the Portal fabric. Leases,
/// routes, and limits are all keyed by it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortalId(String);

impl PortalId {
    /// Derive the ID for a raw Ed25519 public key.
    pub fn derive(public_key: &[u8; 32]) -> Self {
        let mut mac = HmacSha256::new_from_slice(ID_DERIVATION_KEY)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(public_key);
        let digest = mac.finalize().into_bytes();
        Self(base32::encode(BASE32_NO_PAD, &digest[..16]))
    }

    /// Parse an ID from its string representation.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 26 {
            anyhow::bail!("invalid Portal ID length: expected 26 chars, got {}", s.len());
        }
        if !s.bytes().all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)) {
            anyhow::bail!("invalid Portal ID: not base32 (A-Z2-7)");
        }
        Ok(Self(s.to_string()))
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortalId({})", self.0)
    }
}

/// Wire identity: an ID together with the public key it must recompute from.
///
/// Received identities whose ID does not recompute are rejected before any
/// other processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: PortalId,
    pub public_key: [u8; 32],
}

impl Identity {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self {
            id: PortalId::derive(&public_key),
            public_key,
        }
    }

    /// Check the `id == derive(public_key)` invariant.
    pub fn is_consistent(&self) -> bool {
        PortalId::derive(&self.public_key) == self.id
    }
}

/// Long-term Ed25519 credential.
///
/// Holds the signing key; the X25519 static key for Noise is derived on
/// demand from the same seed.
pub struct Credential {
    signing_key: SigningKey,
}

impl Credential {
    /// Generate a new random credential using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstruct a credential from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the Portal ID derived from the public key.
    pub fn id(&self) -> PortalId {
        PortalId::derive(self.signing_key.verifying_key().as_bytes())
    }

    /// Get the wire identity (ID + public key).
    pub fn identity(&self) -> Identity {
        Identity::new(self.public_key())
    }

    /// Get the public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Get the verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the private seed bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message. No domain separation is applied here; callers
    /// prepend a context when they need one.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this credential's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.signing_key
            .verifying_key()
            .verify(message, &sig)
            .is_ok()
    }

    /// Derive the X25519 private key for the Noise handshake.
    ///
    /// SHA-512 over the signing seed, first 32 bytes clamped per RFC 7748.
    /// Derived on every call; callers may cache.
    pub fn x25519_private_key(&self) -> [u8; 32] {
        let mut seed = self.signing_key.to_bytes();
        let digest = Sha512::digest(seed);
        seed.zeroize();

        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);

        out[0] &= 248;
        out[31] &= 127;
        out[31] |= 64;
        out
    }

    /// Derive the X25519 public key matching [`Self::x25519_private_key`].
    pub fn x25519_public_key(&self) -> [u8; 32] {
        let mut private = self.x25519_private_key();
        let secret = x25519_dalek::StaticSecret::from(private);
        private.zeroize();
        *x25519_dalek::PublicKey::from(&secret).as_bytes()
    }

    /// Save the seed to a file, restricted to owner-only on Unix.
    pub fn save(&self, path: &str) -> Result<()> {
        let mut seed = self.seed();
        fs::write(path, seed)?;
        seed.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Load a credential from a seed file.
    pub fn load(path: &str) -> Result<Self> {
        let bytes = fs::read(path).context("failed to read credential seed")?;

        if bytes.len() != 32 {
            anyhow::bail!("invalid credential seed length: expected 32 bytes");
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);

        let cred = Self::from_seed(&seed);
        seed.zeroize();

        Ok(cred)
    }
}

/// Verify a detached signature under a raw Ed25519 public key.
pub fn verify_with_public_key(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_recomputes_from_public_key() {
        let cred = Credential::generate();
        assert_eq!(PortalId::derive(&cred.public_key()), cred.id());
    }

    #[test]
    fn id_is_26_base32_chars() {
        let cred = Credential::generate();
        let id = cred.id();
        assert_eq!(id.as_str().len(), 26);
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)));
    }

    #[test]
    fn id_parse_roundtrip() {
        let cred = Credential::generate();
        let parsed = PortalId::parse(cred.id().as_str()).unwrap();
        assert_eq!(parsed, cred.id());

        assert!(PortalId::parse("short").is_err());
        assert!(PortalId::parse("abcdefghijklmnopqrstuvwxyz").is_err()); // lowercase
        assert!(PortalId::parse("ABCDEFGHIJKLMNOPQRSTUVWX01").is_err()); // 0/1 not in alphabet
    }

    #[test]
    fn identity_consistency_check() {
        let cred = Credential::generate();
        let identity = cred.identity();
        assert!(identity.is_consistent());

        let other = Credential::generate();
        let forged = Identity {
            id: other.id(),
            public_key: cred.public_key(),
        };
        assert!(!forged.is_consistent());
    }

    #[test]
    fn sign_verify() {
        let cred = Credential::generate();
        let sig = cred.sign(b"hello portal");
        assert!(cred.verify(b"hello portal", &sig));
        assert!(!cred.verify(b"wrong message", &sig));
        assert!(verify_with_public_key(&cred.public_key(), b"hello portal", &sig));
    }

    #[test]
    fn x25519_derivation_is_deterministic() {
        let cred = Credential::generate();
        let restored = Credential::from_seed(&cred.seed());

        assert_eq!(cred.x25519_private_key(), restored.x25519_private_key());
        assert_eq!(cred.x25519_public_key(), restored.x25519_public_key());
    }

    #[test]
    fn x25519_keys_are_clamped() {
        let cred = Credential::generate();
        let private = cred.x25519_private_key();
        assert_eq!(private[0] & 7, 0);
        assert_eq!(private[31] & 128, 0);
        assert_eq!(private[31] & 64, 64);
    }

    #[test]
    fn distinct_credentials_distinct_keys() {
        let a = Credential::generate();
        let b = Credential::generate();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.x25519_public_key(), b.x25519_public_key());
    }

    #[test]
    fn seed_roundtrip() {
        let cred = Credential::generate();
        let restored = Credential::from_seed(&cred.seed());
        assert_eq!(restored.public_key(), cred.public_key());
        assert_eq!(restored.id(), cred.id());
    }
}
