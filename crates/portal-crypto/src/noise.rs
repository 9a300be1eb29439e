//! Noise XX handshake with Portal identity binding.
//!
//! Pattern: `Noise_XX_25519_ChaChaPoly_BLAKE2s`, prologue `"portal/noise/1"`.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                              Responder
//!     |  -> e        [alpn]                  |
//!     |------------------------------------->|
//!     |  <- e, ee, s, es  [identity binding] |
//!     |<-------------------------------------|
//!     |  -> s, se         [identity binding] |
//!     |------------------------------------->|
//!     [       session keys established       ]
//! ```
//!
//! Message 1 carries the requested ALPN (`[1B len][tag]`, cleartext but
//! bound into the handshake hash). Messages 2 and 3 carry an **identity
//! binding**: the sender's Ed25519 public key followed by its signature
//! over the sender's own Noise static public key. Verifying the binding
//! ties the Portal ID to the Noise session key, so an impostor cannot
//! present a third party's identity over its own ephemeral session.
//!
//! Both sides validate the peer binding *before* the cipherstates are
//! exposed. A responder that rejects the ALPN or the binding returns an
//! error and writes nothing further; the caller closes the transport
//! silently.

use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use zeroize::Zeroize;

use crate::identity::{verify_with_public_key, Credential, Identity, PortalId};

/// Noise protocol pattern (XX with X25519, ChaCha20-Poly1305, BLAKE2s).
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Prologue bound into the handshake hash.
pub const NOISE_PROLOGUE: &[u8] = b"portal/noise/1";

/// Maximum size of a single Noise handshake message.
const MAX_HANDSHAKE_MSG_SIZE: usize = 65535;

/// Maximum ALPN tag length (one length byte on the wire).
pub const MAX_ALPN_LEN: usize = 255;

/// Identity binding payload: 32-byte Ed25519 public key + 64-byte signature.
const BINDING_LEN: usize = 96;

/// Noise handshake errors.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("handshake already complete")]
    HandshakeAlreadyComplete,

    #[error("invalid handshake message")]
    InvalidMessage,

    #[error("alpn tag malformed or too long")]
    InvalidAlpn,

    #[error("alpn not acceptable")]
    AlpnRejected,

    #[error("identity binding malformed")]
    InvalidIdentity,

    #[error("identity binding signature does not verify")]
    InvalidSignature,

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

/// A completed handshake: transport cipherstates plus the authenticated
/// remote identity and the negotiated ALPN.
pub struct Established {
    pub transport: StatelessTransportState,
    pub remote: Identity,
    pub alpn: String,
}

impl Established {
    pub fn remote_id(&self) -> &PortalId {
        &self.remote.id
    }
}

/// Encode the ALPN payload for message 1: `[1B len][tag]`.
fn encode_alpn(alpn: &str) -> Result<Vec<u8>, NoiseError> {
    let bytes = alpn.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_ALPN_LEN {
        return Err(NoiseError::InvalidAlpn);
    }
    let mut payload = Vec::with_capacity(1 + bytes.len());
    payload.push(bytes.len() as u8);
    payload.extend_from_slice(bytes);
    Ok(payload)
}

/// Decode and validate the message-1 ALPN payload.
fn decode_alpn(payload: &[u8]) -> Result<String, NoiseError> {
    if payload.is_empty() {
        return Err(NoiseError::InvalidAlpn);
    }
    let declared = payload[0] as usize;
    if payload.len() != 1 + declared || declared == 0 {
        return Err(NoiseError::InvalidAlpn);
    }
    String::from_utf8(payload[1..].to_vec()).map_err(|_| NoiseError::InvalidAlpn)
}

/// Build the 96-byte identity binding: our Ed25519 public key and our
/// signature over our own Noise static public key.
fn encode_binding(credential: &Credential) -> Vec<u8> {
    let noise_static = credential.x25519_public_key();
    let signature = credential.sign(&noise_static);

    let mut payload = Vec::with_capacity(BINDING_LEN);
    payload.extend_from_slice(&credential.public_key());
    payload.extend_from_slice(&signature);
    payload
}

/// Validate a received identity binding against the peer's Noise static
/// public key, returning the authenticated identity.
fn verify_binding(payload: &[u8], peer_noise_static: &[u8]) -> Result<Identity, NoiseError> {
    if payload.len() != BINDING_LEN {
        return Err(NoiseError::InvalidIdentity);
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&payload[..32]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&payload[32..]);

    if !verify_with_public_key(&public_key, peer_noise_static, &signature) {
        return Err(NoiseError::InvalidSignature);
    }
    Ok(Identity::new(public_key))
}

enum HandshakeSide {
    Handshake(Box<HandshakeState>),
    Transport(StatelessTransportState),
    Invalid,
}

fn build_handshake(credential: &Credential, initiator: bool) -> Result<Box<HandshakeState>, NoiseError> {
    let mut private = credential.x25519_private_key();
    let builder = Builder::new(NOISE_PATTERN.parse()?)
        .prologue(NOISE_PROLOGUE)
        .local_private_key(&private);
    let state = if initiator {
        builder.build_initiator()?
    } else {
        builder.build_responder()?
    };
    private.zeroize();
    Ok(Box::new(state))
}

/// Initiator (client) side of the Portal handshake.
pub struct Initiator<'a> {
    credential: &'a Credential,
    alpn: String,
    state: HandshakeSide,
    remote: Option<Identity>,
}

impl<'a> Initiator<'a> {
    pub fn new(credential: &'a Credential, alpn: &str) -> Result<Self, NoiseError> {
        if alpn.is_empty() || alpn.len() > MAX_ALPN_LEN {
            return Err(NoiseError::InvalidAlpn);
        }
        Ok(Self {
            credential,
            alpn: alpn.to_string(),
            state: HandshakeSide::Handshake(build_handshake(credential, true)?),
            remote: None,
        })
    }

    /// Generate message 1 (`-> e` with the ALPN payload).
    pub fn write_message_1(&mut self) -> Result<Vec<u8>, NoiseError> {
        let state = match &mut self.state {
            HandshakeSide::Handshake(s) => s,
            _ => return Err(NoiseError::HandshakeAlreadyComplete),
        };

        let payload = encode_alpn(&self.alpn)?;
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.write_message(&payload, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process message 2 (`<- e, ee, s, es`) and validate the responder's
    /// identity binding.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        let state = match &mut self.state {
            HandshakeSide::Handshake(s) => s,
            _ => return Err(NoiseError::HandshakeAlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.read_message(message, &mut buf)?;

        let responder_static = state
            .get_remote_static()
            .ok_or(NoiseError::InvalidMessage)?
            .to_vec();
        self.remote = Some(verify_binding(&buf[..len], &responder_static)?);
        Ok(())
    }

    /// Generate message 3 (`-> s, se` with our identity binding) and
    /// transition to transport mode.
    pub fn write_message_3(&mut self) -> Result<Vec<u8>, NoiseError> {
        let old_state = std::mem::replace(&mut self.state, HandshakeSide::Invalid);

        let mut handshake = match old_state {
            HandshakeSide::Handshake(s) => s,
            other => {
                self.state = other;
                return Err(NoiseError::HandshakeAlreadyComplete);
            }
        };

        let payload = encode_binding(self.credential);
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = handshake.write_message(&payload, &mut buf)?;
        buf.truncate(len);

        let transport = handshake.into_stateless_transport_mode()?;
        self.state = HandshakeSide::Transport(transport);
        Ok(buf)
    }

    /// Extract the established session. Fails unless all three messages
    /// were processed and the binding verified.
    pub fn finish(self) -> Result<Established, NoiseError> {
        let remote = self.remote.ok_or(NoiseError::HandshakeNotComplete)?;
        match self.state {
            HandshakeSide::Transport(transport) => Ok(Established {
                transport,
                remote,
                alpn: self.alpn,
            }),
            _ => Err(NoiseError::HandshakeNotComplete),
        }
    }
}

/// Responder (relay) side of the Portal handshake.
pub struct Responder<'a> {
    credential: &'a Credential,
    accepted_alpns: Vec<String>,
    state: HandshakeSide,
    alpn: Option<String>,
    remote: Option<Identity>,
}

impl<'a> Responder<'a> {
    pub fn new(credential: &'a Credential, accepted_alpns: &[String]) -> Result<Self, NoiseError> {
        Ok(Self {
            credential,
            accepted_alpns: accepted_alpns.to_vec(),
            state: HandshakeSide::Handshake(build_handshake(credential, false)?),
            alpn: None,
            remote: None,
        })
    }

    /// Process message 1. Returns the requested ALPN after checking it
    /// against the acceptable set.
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<&str, NoiseError> {
        let state = match &mut self.state {
            HandshakeSide::Handshake(s) => s,
            _ => return Err(NoiseError::HandshakeAlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.read_message(message, &mut buf)?;

        let alpn = decode_alpn(&buf[..len])?;
        if !self.accepted_alpns.iter().any(|a| a == &alpn) {
            return Err(NoiseError::AlpnRejected);
        }
        Ok(self.alpn.insert(alpn))
    }

    /// Generate message 2 carrying our identity binding.
    pub fn write_message_2(&mut self) -> Result<Vec<u8>, NoiseError> {
        if self.alpn.is_none() {
            return Err(NoiseError::HandshakeNotComplete);
        }
        let state = match &mut self.state {
            HandshakeSide::Handshake(s) => s,
            _ => return Err(NoiseError::HandshakeAlreadyComplete),
        };

        let payload = encode_binding(self.credential);
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.write_message(&payload, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process message 3, validate the initiator's identity binding, and
    /// transition to transport mode.
    pub fn read_message_3(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        let old_state = std::mem::replace(&mut self.state, HandshakeSide::Invalid);

        let mut handshake = match old_state {
            HandshakeSide::Handshake(s) => s,
            other => {
                self.state = other;
                return Err(NoiseError::HandshakeAlreadyComplete);
            }
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = handshake.read_message(message, &mut buf)?;

        let initiator_static = handshake
            .get_remote_static()
            .ok_or(NoiseError::InvalidMessage)?
            .to_vec();
        self.remote = Some(verify_binding(&buf[..len], &initiator_static)?);

        let transport = handshake.into_stateless_transport_mode()?;
        self.state = HandshakeSide::Transport(transport);
        Ok(())
    }

    /// Extract the established session.
    pub fn finish(self) -> Result<Established, NoiseError> {
        let remote = self.remote.ok_or(NoiseError::HandshakeNotComplete)?;
        let alpn = self.alpn.ok_or(NoiseError::HandshakeNotComplete)?;
        match self.state {
            HandshakeSide::Transport(transport) => Ok(Established {
                transport,
                remote,
                alpn,
            }),
            _ => Err(NoiseError::HandshakeNotComplete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(
        initiator_cred: &Credential,
        responder_cred: &Credential,
        alpn: &str,
        accepted: &[String],
    ) -> Result<(Established, Established), NoiseError> {
        let mut initiator = Initiator::new(initiator_cred, alpn)?;
        let mut responder = Responder::new(responder_cred, accepted)?;

        let msg1 = initiator.write_message_1()?;
        responder.read_message_1(&msg1)?;

        let msg2 = responder.write_message_2()?;
        initiator.read_message_2(&msg2)?;

        let msg3 = initiator.write_message_3()?;
        responder.read_message_3(&msg3)?;

        Ok((initiator.finish()?, responder.finish()?))
    }

    #[test]
    fn full_handshake_binds_identities() {
        let a = Credential::generate();
        let b = Credential::generate();

        let (client, server) =
            run_handshake(&a, &b, "portal/ctl/1", &["portal/ctl/1".to_string()]).unwrap();

        assert_eq!(client.remote_id(), &b.id());
        assert_eq!(server.remote_id(), &a.id());
        assert_eq!(server.alpn, "portal/ctl/1");
        assert!(client.remote.is_consistent());
        assert!(server.remote.is_consistent());
    }

    #[test]
    fn transport_roundtrip_after_handshake() {
        let a = Credential::generate();
        let b = Credential::generate();
        let (client, server) =
            run_handshake(&a, &b, "echo", &["echo".to_string()]).unwrap();

        let mut ct = vec![0u8; 1024];
        let n = client
            .transport
            .write_message(0, b"hello, portal", &mut ct)
            .unwrap();

        let mut pt = vec![0u8; 1024];
        let m = server.transport.read_message(0, &ct[..n], &mut pt).unwrap();
        assert_eq!(&pt[..m], b"hello, portal");
    }

    #[test]
    fn responder_rejects_unknown_alpn() {
        let a = Credential::generate();
        let b = Credential::generate();

        let mut initiator = Initiator::new(&a, "alpn-a").unwrap();
        let mut responder = Responder::new(&b, &["alpn-b".to_string()]).unwrap();

        let msg1 = initiator.write_message_1().unwrap();
        let err = responder.read_message_1(&msg1).unwrap_err();
        assert!(matches!(err, NoiseError::AlpnRejected));

        // The responder never wrote anything; message 2 is refused too.
        assert!(responder.write_message_2().is_err());
    }

    #[test]
    fn alpn_payload_must_parse() {
        assert!(decode_alpn(&[]).is_err());
        assert!(decode_alpn(&[0]).is_err());
        assert!(decode_alpn(&[5, b'a', b'b']).is_err()); // declared 5, got 2
        assert_eq!(decode_alpn(&[2, b'h', b'i']).unwrap(), "hi");
    }

    #[test]
    fn binding_with_wrong_static_fails() {
        let cred = Credential::generate();
        let binding = encode_binding(&cred);

        // Verifies over the matching static key.
        let noise_static = cred.x25519_public_key();
        let identity = verify_binding(&binding, &noise_static).unwrap();
        assert_eq!(identity.id, cred.id());

        // A different static key must not verify: this is what stops an
        // impostor from replaying someone else's binding on its own session.
        let other = Credential::generate();
        let err = verify_binding(&binding, &other.x25519_public_key()).unwrap_err();
        assert!(matches!(err, NoiseError::InvalidSignature));

        // Truncated bindings are rejected outright.
        assert!(matches!(
            verify_binding(&binding[..64], &noise_static).unwrap_err(),
            NoiseError::InvalidIdentity
        ));
    }

    #[test]
    fn tampered_handshake_message_fails() {
        let a = Credential::generate();
        let b = Credential::generate();

        let mut initiator = Initiator::new(&a, "echo").unwrap();
        let mut responder = Responder::new(&b, &["echo".to_string()]).unwrap();

        let msg1 = initiator.write_message_1().unwrap();
        responder.read_message_1(&msg1).unwrap();

        let mut msg2 = responder.write_message_2().unwrap();
        let last = msg2.len() - 1;
        msg2[last] ^= 0xff;
        assert!(initiator.read_message_2(&msg2).is_err());
    }
}
