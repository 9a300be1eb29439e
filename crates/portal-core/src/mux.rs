//! Minimal stream multiplexer over a secure channel.
//!
//! The dispatcher needs a fresh bidirectional stream per incoming client,
//! all carried over the single channel a lease holder keeps open. Frames
//! are `[4B stream id BE][1B opcode][payload]` inside channel messages;
//! every frame is sized to fit a single Noise message, so the channel
//! preserves frame boundaries and one read yields one frame.
//!
//! Stream IDs are split by role (initiator odd, responder even) so both
//! sides can open streams without coordination. There is no windowing:
//! backpressure is the underlying channel's, which is the underlying
//! transport's.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelError, SecureChannel, MAX_NOISE_PLAINTEXT};

const OP_DATA: u8 = 0;
const OP_SYN: u8 = 1;
const OP_FIN: u8 = 2;
const OP_RST: u8 = 3;

/// Bytes of stream id + opcode in front of every frame.
const FRAME_HEADER: usize = 5;

/// Largest payload carried by a single DATA frame. Header plus payload
/// must fit one Noise message, or the one-frame-per-message invariant the
/// read loop depends on breaks.
const MAX_DATA_FRAME: usize = MAX_NOISE_PLAINTEXT - FRAME_HEADER;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer closed")]
    Closed,
}

/// Which end of the secure channel this multiplexer sits on. Determines
/// the stream-ID parity so both sides allocate collision-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Initiator,
    Responder,
}

struct Frame {
    id: u32,
    opcode: u8,
    payload: Bytes,
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER + frame.payload.len());
    buf.extend_from_slice(&frame.id.to_be_bytes());
    buf.push(frame.opcode);
    buf.extend_from_slice(&frame.payload);
    buf
}

fn decode_frame(mut msg: Vec<u8>) -> Option<Frame> {
    if msg.len() < FRAME_HEADER {
        return None;
    }
    let id = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
    let opcode = msg[4];
    if opcode > OP_RST {
        return None;
    }
    msg.drain(..FRAME_HEADER);
    Some(Frame {
        id,
        opcode,
        payload: Bytes::from(msg),
    })
}

struct Shared {
    /// Inbound delivery handles for locally live streams.
    streams: StdMutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Shared {
    fn send_frame(&self, id: u32, opcode: u8, payload: Bytes) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        self.out_tx
            .send(Frame { id, opcode, payload })
            .map_err(|_| MuxError::Closed)
    }
}

/// Handle to a running multiplexer. Clonable; open and accept from
/// anywhere.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
    accept_rx: Arc<Mutex<mpsc::UnboundedReceiver<MuxStream>>>,
    channel: Arc<SecureChannel>,
}

impl MuxHandle {
    /// Start a multiplexer over an established channel. Spawns the reader
    /// and writer tasks; they live until the channel dies.
    pub fn start(channel: Arc<SecureChannel>, role: MuxRole) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            streams: StdMutex::new(HashMap::new()),
            out_tx,
            next_id: AtomicU32::new(match role {
                MuxRole::Initiator => 1,
                MuxRole::Responder => 2,
            }),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(channel.clone(), out_rx, shared.clone()));
        tokio::spawn(read_loop(channel.clone(), shared.clone(), accept_tx, writer));

        Self {
            shared,
            accept_rx: Arc::new(Mutex::new(accept_rx)),
            channel,
        }
    }

    /// Open a fresh stream toward the peer.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut streams) = self.shared.streams.lock() {
            streams.insert(id, tx);
        }

        self.shared.send_frame(id, OP_SYN, Bytes::new())?;
        trace!(stream = id, "mux stream opened");
        Ok(MuxStream::new(id, self.shared.clone(), rx))
    }

    /// Wait for the peer to open a stream. Returns `None` once the channel
    /// is gone.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn channel(&self) -> &Arc<SecureChannel> {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the underlying channel; every stream unblocks with EOF or a
    /// broken-pipe error.
    pub async fn close(&self) {
        self.channel.close().await;
        self.shared.closed.store(true, Ordering::Release);
    }
}

async fn write_loop(
    channel: Arc<SecureChannel>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = out_rx.recv().await {
        let encoded = encode_frame(&frame);
        if let Err(e) = channel.write(&encoded).await {
            if !matches!(e, ChannelError::Closed) {
                warn!("mux write failed: {e}");
            }
            break;
        }
    }
    shared.closed.store(true, Ordering::Release);
    channel.close().await;
}

async fn read_loop(
    channel: Arc<SecureChannel>,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    writer: tokio::task::JoinHandle<()>,
) {
    loop {
        let msg = match channel.read_message().await {
            Ok(msg) => msg,
            Err(e) => {
                if !matches!(e, ChannelError::Closed) {
                    warn!("mux read failed: {e}");
                }
                break;
            }
        };

        let Some(frame) = decode_frame(msg) else {
            warn!("malformed mux frame, dropping channel");
            break;
        };

        match frame.opcode {
            OP_SYN => {
                let (tx, rx) = mpsc::unbounded_channel();
                let duplicate = {
                    let Ok(mut streams) = shared.streams.lock() else {
                        break;
                    };
                    if streams.contains_key(&frame.id) {
                        true
                    } else {
                        streams.insert(frame.id, tx);
                        false
                    }
                };
                if duplicate {
                    let _ = shared.send_frame(frame.id, OP_RST, Bytes::new());
                    continue;
                }
                let stream = MuxStream::new(frame.id, shared.clone(), rx);
                if accept_tx.send(stream).is_err() {
                    // Nobody accepting anymore; refuse politely.
                    if let Ok(mut streams) = shared.streams.lock() {
                        streams.remove(&frame.id);
                    }
                    let _ = shared.send_frame(frame.id, OP_RST, Bytes::new());
                }
            }
            OP_DATA => {
                let gone = {
                    let Ok(streams) = shared.streams.lock() else {
                        break;
                    };
                    match streams.get(&frame.id) {
                        Some(tx) => tx.send(frame.payload).is_err(),
                        None => true,
                    }
                };
                if gone {
                    if let Ok(mut streams) = shared.streams.lock() {
                        streams.remove(&frame.id);
                    }
                    let _ = shared.send_frame(frame.id, OP_RST, Bytes::new());
                }
            }
            OP_FIN | OP_RST => {
                // Dropping the sender delivers EOF once buffered data is
                // drained (FIN) or immediately (RST arrives with nothing
                // buffered in practice).
                if let Ok(mut streams) = shared.streams.lock() {
                    streams.remove(&frame.id);
                }
            }
            _ => unreachable!("decode_frame validated the opcode"),
        }
    }

    shared.closed.store(true, Ordering::Release);
    if let Ok(mut streams) = shared.streams.lock() {
        streams.clear();
    }
    channel.close().await;
    // The writer would otherwise block on its queue forever.
    writer.abort();
    debug!("mux read loop ended");
}

/// One multiplexed bidirectional stream. Implements `AsyncRead` and
/// `AsyncWrite`; shutdown sends FIN, drop without shutdown sends RST.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    partial: Option<Bytes>,
    write_closed: bool,
}

impl MuxStream {
    fn new(id: u32, shared: Arc<Shared>, inbound: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            id,
            shared,
            inbound,
            partial: None,
            write_closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = &mut this.partial {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    this.partial = None;
                }
                return Poll::Ready(Ok(()));
            }

            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    if !bytes.is_empty() {
                        this.partial = Some(bytes);
                    }
                }
                // Sender gone: FIN/RST or channel teardown. Clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let n = buf.len().min(MAX_DATA_FRAME);
        this.shared
            .send_frame(this.id, OP_DATA, Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            let _ = this.shared.send_frame(this.id, OP_FIN, Bytes::new());
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.shared.streams.lock() {
            streams.remove(&self.id);
        }
        if !self.write_closed {
            let _ = self.shared.send_frame(self.id, OP_RST, Bytes::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_crypto::identity::Credential;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn mux_pair() -> (MuxHandle, MuxHandle) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let client_cred = Credential::generate();
        let server_cred = Credential::generate();
        let timeout = Duration::from_secs(5);

        let server = tokio::spawn(async move {
            SecureChannel::accept(server_io, &server_cred, &["mux".to_string()], timeout)
                .await
                .unwrap()
        });
        let client = SecureChannel::connect(client_io, &client_cred, "mux", timeout)
            .await
            .unwrap();
        let server = server.await.unwrap();

        (
            MuxHandle::start(Arc::new(client), MuxRole::Initiator),
            MuxHandle::start(Arc::new(server), MuxRole::Responder),
        )
    }

    #[tokio::test]
    async fn open_accept_roundtrip() {
        let (client, server) = mux_pair().await;

        let mut opened = client.open_stream().unwrap();
        opened.write_all(b"ping").await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn both_sides_can_open_without_collision() {
        let (client, server) = mux_pair().await;

        let a = client.open_stream().unwrap();
        let b = server.open_stream().unwrap();
        assert_ne!(a.id() % 2, b.id() % 2);

        let from_client = server.accept_stream().await.unwrap();
        let from_server = client.accept_stream().await.unwrap();
        assert_eq!(from_client.id(), a.id());
        assert_eq!(from_server.id(), b.id());
    }

    #[tokio::test]
    async fn fin_delivers_eof_after_data() {
        let (client, server) = mux_pair().await;

        let mut opened = client.open_stream().unwrap();
        opened.write_all(b"tail").await.unwrap();
        opened.shutdown().await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        let mut collected = Vec::new();
        accepted.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"tail");
    }

    #[tokio::test]
    async fn interleaved_streams_stay_separate() {
        let (client, server) = mux_pair().await;

        let mut s1 = client.open_stream().unwrap();
        let mut s2 = client.open_stream().unwrap();
        s1.write_all(b"one").await.unwrap();
        s2.write_all(b"two").await.unwrap();
        s1.write_all(b"-more").await.unwrap();

        let mut a1 = server.accept_stream().await.unwrap();
        let mut a2 = server.accept_stream().await.unwrap();

        let mut buf = [0u8; 8];
        a1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one-more");
        let mut buf = [0u8; 3];
        a2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn closing_mux_wakes_streams() {
        let (client, server) = mux_pair().await;

        let mut opened = client.open_stream().unwrap();
        let mut accepted = server.accept_stream().await.unwrap();

        client.close().await;

        let mut buf = [0u8; 4];
        // Reader on the far side unblocks with EOF.
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        // Local side can no longer open.
        assert!(matches!(client.open_stream(), Err(MuxError::Closed)));
        let _ = opened.shutdown().await;
    }

    #[tokio::test]
    async fn large_transfer_chunks_through_frames() {
        let (client, server) = mux_pair().await;

        let payload: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut opened = client.open_stream().unwrap();
        let writer = tokio::spawn(async move {
            opened.write_all(&payload).await.unwrap();
            opened.shutdown().await.unwrap();
        });

        let mut accepted = server.accept_stream().await.unwrap();
        let mut collected = Vec::new();
        accepted.read_to_end(&mut collected).await.unwrap();
        writer.await.unwrap();
        assert_eq!(collected, expected);
    }
}
