//! Secure channel: the framed, encrypted, full-duplex byte pipe.
//!
//! A `SecureChannel` wraps any reliable ordered stream. Construction runs
//! the Noise XX handshake (with ALPN and identity binding, see
//! `portal-crypto`), after which application data flows as
//! `[4B big-endian length][ciphertext + 16B tag]` records.
//!
//! Reads and writes are concurrent by design: a write mutex orders the
//! outgoing nonce counter (counter nonces make ordering a correctness
//! requirement, not an optimization), and a separate read mutex covers the
//! incoming counter plus the overflow buffer holding plaintext that did
//! not fit the caller's buffer.
//!
//! Noise caps every message at 65535 bytes, so a write is chunked into
//! cipher-sized pieces, each independently encrypted under its own nonce
//! and length-prefixed on the wire. [`write`](SecureChannel::write)
//! preserves nothing beyond byte order; only writes that fit a single
//! Noise message ([`MAX_NOISE_PLAINTEXT`]) keep their message boundary,
//! which is what the multiplexer relies on.
//!
//! Any cipher failure is terminal: the channel is poisoned and every
//! subsequent operation fails. There is no re-sync.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use snow::StatelessTransportState;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroize;

use portal_crypto::identity::{Credential, Identity, PortalId};
use portal_crypto::noise::{Established, Initiator, NoiseError, Responder};

use crate::framing::{read_record, write_record};

/// AEAD tag length for ChaCha20-Poly1305.
pub const TAG_LEN: usize = 16;

/// Hard Noise limit on a single message, ciphertext including the tag.
pub const NOISE_MAX_MESSAGE: usize = 65535;

/// Largest plaintext one Noise message can carry. Writes up to this size
/// arrive as exactly one message on the far side.
pub const MAX_NOISE_PLAINTEXT: usize = NOISE_MAX_MESSAGE - TAG_LEN;

/// Upper bound on one application fragment; longer writes split here
/// first, then into cipher-sized messages.
pub const MAX_PLAINTEXT_FRAGMENT: usize = 32 * 1024 * 1024;

/// Any reliable ordered byte stream a channel can ride on.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

type BoxedConn = Box<dyn Conn>;

/// Secure-channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("channel closed")]
    Closed,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<NoiseError> for ChannelError {
    fn from(err: NoiseError) -> Self {
        ChannelError::Handshake(err.to_string())
    }
}

struct ReadState {
    stream: ReadHalf<BoxedConn>,
    /// Plaintext left over from a frame larger than the caller's buffer.
    overflow: Vec<u8>,
    nonce: u64,
}

struct WriteState {
    stream: WriteHalf<BoxedConn>,
    nonce: u64,
}

/// Authenticated, encrypted, framed, full-duplex byte pipe.
pub struct SecureChannel {
    transport: StatelessTransportState,
    local_id: PortalId,
    remote: Identity,
    alpn: String,
    closed: AtomicBool,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
}

impl SecureChannel {
    /// Dial side: run the handshake as initiator, requesting `alpn`.
    pub async fn connect<S: Conn + 'static>(
        stream: S,
        credential: &Credential,
        alpn: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let mut stream: BoxedConn = Box::new(stream);

        let established = tokio::time::timeout(handshake_timeout, async {
            let mut initiator = Initiator::new(credential, alpn)?;

            let msg1 = initiator.write_message_1()?;
            write_record(&mut stream, &msg1).await?;

            let msg2 = read_record(&mut stream).await?;
            initiator.read_message_2(&msg2)?;

            let msg3 = initiator.write_message_3()?;
            write_record(&mut stream, &msg3).await?;

            Ok::<_, ChannelError>(initiator.finish()?)
        })
        .await
        .map_err(|_| ChannelError::Timeout)??;

        Ok(Self::from_established(stream, credential, established))
    }

    /// Listen side: run the handshake as responder. Validation failures
    /// (ALPN, identity binding) error out without writing anything back,
    /// so a probing peer learns nothing.
    pub async fn accept<S: Conn + 'static>(
        stream: S,
        credential: &Credential,
        accepted_alpns: &[String],
        handshake_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let mut stream: BoxedConn = Box::new(stream);

        let established = tokio::time::timeout(handshake_timeout, async {
            let mut responder = Responder::new(credential, accepted_alpns)?;

            let msg1 = read_record(&mut stream).await?;
            responder.read_message_1(&msg1)?;

            let msg2 = responder.write_message_2()?;
            write_record(&mut stream, &msg2).await?;

            let msg3 = read_record(&mut stream).await?;
            responder.read_message_3(&msg3)?;

            Ok::<_, ChannelError>(responder.finish()?)
        })
        .await
        .map_err(|_| ChannelError::Timeout)??;

        Ok(Self::from_established(stream, credential, established))
    }

    fn from_established(stream: BoxedConn, credential: &Credential, established: Established) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        debug!(
            remote = %established.remote.id,
            alpn = %established.alpn,
            "secure channel established"
        );

        Self {
            transport: established.transport,
            local_id: credential.id(),
            remote: established.remote,
            alpn: established.alpn,
            closed: AtomicBool::new(false),
            read: Mutex::new(ReadState {
                stream: read_half,
                overflow: Vec::new(),
                nonce: 0,
            }),
            write: Mutex::new(WriteState {
                stream: write_half,
                nonce: 0,
            }),
        }
    }

    pub fn local_id(&self) -> &PortalId {
        &self.local_id
    }

    pub fn remote_id(&self) -> &PortalId {
        &self.remote.id
    }

    pub fn remote_identity(&self) -> &Identity {
        &self.remote
    }

    pub fn alpn(&self) -> &str {
        &self.alpn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encrypt and send `data`, fragmenting at
    /// [`MAX_PLAINTEXT_FRAGMENT`] and then at the Noise message limit.
    /// Every piece is its own framed, independently encrypted record.
    /// Writes from concurrent tasks are serialized by the write mutex.
    pub async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut state = self.write.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        // Empty writes still produce one frame so a zero-length message is
        // observable on the far side.
        let mut chunks = data.chunks(MAX_PLAINTEXT_FRAGMENT);
        let first = chunks.next().unwrap_or(&[]);

        self.write_fragment(&mut state, first).await?;
        for chunk in chunks {
            self.write_fragment(&mut state, chunk).await?;
        }
        Ok(())
    }

    /// Write one fragment as a run of Noise messages. snow rejects any
    /// payload past [`MAX_NOISE_PLAINTEXT`] rather than chunking it, so
    /// the split happens here, one nonce and one wire record per message.
    async fn write_fragment(
        &self,
        state: &mut WriteState,
        plaintext: &[u8],
    ) -> Result<(), ChannelError> {
        let mut pieces = plaintext.chunks(MAX_NOISE_PLAINTEXT);
        let first = pieces.next().unwrap_or(&[]);

        self.write_noise_message(state, first).await?;
        for piece in pieces {
            self.write_noise_message(state, piece).await?;
        }
        Ok(())
    }

    async fn write_noise_message(
        &self,
        state: &mut WriteState,
        plaintext: &[u8],
    ) -> Result<(), ChannelError> {
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        let n = self
            .transport
            .write_message(state.nonce, plaintext, &mut ciphertext)
            .map_err(|e| {
                self.poison();
                ChannelError::Encryption(e.to_string())
            })?;
        state.nonce += 1;

        write_record(&mut state.stream, &ciphertext[..n])
            .await
            .map_err(|e| {
                self.poison();
                ChannelError::Io(e)
            })
    }

    /// Read decrypted bytes into `buf`, returning the count. Plaintext
    /// beyond `buf`'s capacity is buffered and returned by later reads.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.read.lock().await;
        if self.is_closed() {
            state.overflow.zeroize();
            state.overflow.clear();
            return Err(ChannelError::Closed);
        }

        if !state.overflow.is_empty() {
            let n = state.overflow.len().min(buf.len());
            buf[..n].copy_from_slice(&state.overflow[..n]);
            state.overflow.drain(..n);
            return Ok(n);
        }

        let plaintext = self.read_frame(&mut state).await?;
        let n = plaintext.len().min(buf.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        if n < plaintext.len() {
            state.overflow.extend_from_slice(&plaintext[n..]);
        }
        Ok(n)
    }

    /// Read one whole decrypted Noise message. Used by layers that rely
    /// on message boundaries (the multiplexer) — those hold only for
    /// writes no larger than [`MAX_NOISE_PLAINTEXT`]. Do not mix with
    /// [`read`](Self::read) unless the overflow buffer is known to be
    /// empty.
    pub async fn read_message(&self) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.read.lock().await;
        if self.is_closed() {
            state.overflow.zeroize();
            state.overflow.clear();
            return Err(ChannelError::Closed);
        }
        self.read_frame(&mut state).await
    }

    async fn read_frame(&self, state: &mut ReadState) -> Result<Vec<u8>, ChannelError> {
        let ciphertext = match read_record(&mut state.stream).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // Peer closed the transport; everything after is Closed.
                self.poison();
                return Err(ChannelError::Closed);
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                self.poison();
                return Err(ChannelError::Framing(e.to_string()));
            }
            Err(e) => {
                self.poison();
                return Err(ChannelError::Io(e));
            }
        };

        if ciphertext.len() < TAG_LEN {
            self.poison();
            return Err(ChannelError::Framing(format!(
                "ciphertext of {} bytes is shorter than the auth tag",
                ciphertext.len()
            )));
        }

        let mut plaintext = vec![0u8; ciphertext.len()];
        let n = self
            .transport
            .read_message(state.nonce, &ciphertext, &mut plaintext)
            .map_err(|e| {
                self.poison();
                ChannelError::Decryption(e.to_string())
            })?;
        state.nonce += 1;
        plaintext.truncate(n);
        Ok(plaintext)
    }

    fn poison(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close the channel. Idempotent; wakes no blocked reader by itself
    /// (the transport close does), but every future read/write fails with
    /// [`ChannelError::Closed`] and the overflow buffer is wiped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.write.lock().await;
            use tokio::io::AsyncWriteExt;
            let _ = state.stream.shutdown().await;
        }

        // Best effort: if no read is in flight, wipe the overflow now.
        // Otherwise the next read call does it.
        if let Ok(mut state) = self.read.try_lock() {
            state.overflow.zeroize();
            state.overflow.clear();
        }

        debug!(remote = %self.remote.id, "secure channel closed");
    }
}
