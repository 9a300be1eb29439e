//! SNI-based TCP routing into the fabric.
//!
//! For each accepted connection the router peeks the first TLS record,
//! expects a ClientHello, extracts the `server_name` extension, and hands
//! the untouched byte stream to the dispatcher for the matching route.
//! The peeked bytes are replayed in front of the downstream reader; the
//! router never consumes bytes it could not interpret.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use portal_crypto::identity::PortalId;

/// How long a connection gets to produce its ClientHello.
pub const SNI_PEEK_DEADLINE: Duration = Duration::from_secs(5);

/// Peek bound: one maximum TLS record plus header slack.
pub const MAX_PEEK: usize = 18 * 1024;

const TLS_CONTENT_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const TLS_SNI_HOSTNAME: u8 = 0x00;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("not a tls client hello")]
    NotClientHello,

    #[error("client hello carries no sni")]
    NoSni,

    #[error("sni hostname violates rfc 1035/1123")]
    InvalidHostname,

    #[error("tls record exceeds peek bound")]
    Oversized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stream wrapper that replays the peeked prefix before reading from the
/// underlying transport. Writes pass straight through. No seeking.
pub struct PeekStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PeekStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix: Bytes::from(prefix),
            inner,
        }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Append exactly `n` more bytes from `stream` onto `consumed`, keeping
/// whatever partial data arrived if the stream ends early.
async fn pull<S: AsyncRead + Unpin>(
    stream: &mut S,
    consumed: &mut Vec<u8>,
    n: usize,
) -> io::Result<()> {
    let target = consumed.len() + n;
    let mut chunk = [0u8; 4096];
    while consumed.len() < target {
        let want = (target - consumed.len()).min(chunk.len());
        let got = stream.read(&mut chunk[..want]).await?;
        if got == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        consumed.extend_from_slice(&chunk[..got]);
    }
    Ok(())
}

/// Peek the ClientHello and extract the SNI. Always returns the wrapped
/// stream so the consumed bytes are never lost, even on failure.
pub async fn peek_sni<S: AsyncRead + Unpin>(
    mut stream: S,
) -> (PeekStream<S>, Result<String, SniError>) {
    let mut consumed = Vec::new();

    if let Err(e) = pull(&mut stream, &mut consumed, 5).await {
        return (PeekStream::new(consumed, stream), Err(e.into()));
    }

    if consumed[0] != TLS_CONTENT_HANDSHAKE {
        return (
            PeekStream::new(consumed, stream),
            Err(SniError::NotClientHello),
        );
    }
    let record_len = u16::from_be_bytes([consumed[3], consumed[4]]) as usize;
    if 5 + record_len > MAX_PEEK {
        return (PeekStream::new(consumed, stream), Err(SniError::Oversized));
    }

    if let Err(e) = pull(&mut stream, &mut consumed, record_len).await {
        return (PeekStream::new(consumed, stream), Err(e.into()));
    }

    let result = parse_client_hello_sni(&consumed[5..]).and_then(|host| {
        normalize_hostname(&host).ok_or(SniError::InvalidHostname)
    });
    (PeekStream::new(consumed, stream), result)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }
}

/// Walk one handshake record and return the first `host_name` entry of
/// the `server_name` extension.
fn parse_client_hello_sni(record: &[u8]) -> Result<String, SniError> {
    let mut cur = Cursor::new(record);

    if cur.u8() != Some(TLS_HANDSHAKE_CLIENT_HELLO) {
        return Err(SniError::NotClientHello);
    }
    let len_bytes = cur.take(3).ok_or(SniError::NotClientHello)?;
    let body_len = u32::from_be_bytes([0, len_bytes[0], len_bytes[1], len_bytes[2]]) as usize;
    if body_len + 4 > record.len() {
        return Err(SniError::NotClientHello);
    }

    // client_version + random
    cur.take(2 + 32).ok_or(SniError::NotClientHello)?;

    let session_id_len = cur.u8().ok_or(SniError::NotClientHello)? as usize;
    cur.take(session_id_len).ok_or(SniError::NotClientHello)?;

    let cipher_suites_len = cur.u16().ok_or(SniError::NotClientHello)? as usize;
    cur.take(cipher_suites_len).ok_or(SniError::NotClientHello)?;

    let compression_len = cur.u8().ok_or(SniError::NotClientHello)? as usize;
    cur.take(compression_len).ok_or(SniError::NotClientHello)?;

    let extensions_len = cur.u16().ok_or(SniError::NoSni)? as usize;
    let extensions = cur.take(extensions_len).ok_or(SniError::NoSni)?;

    let mut ext = Cursor::new(extensions);
    while let (Some(ext_type), Some(ext_len)) = (ext.u16(), ext.u16()) {
        let ext_data = ext.take(ext_len as usize).ok_or(SniError::NoSni)?;
        if ext_type != TLS_EXT_SERVER_NAME {
            continue;
        }

        let mut names = Cursor::new(ext_data);
        let list_len = names.u16().ok_or(SniError::NoSni)? as usize;
        let list = names.take(list_len).ok_or(SniError::NoSni)?;

        let mut entry = Cursor::new(list);
        while let Some(name_type) = entry.u8() {
            let name_len = entry.u16().ok_or(SniError::NoSni)? as usize;
            let name = entry.take(name_len).ok_or(SniError::NoSni)?;
            if name_type == TLS_SNI_HOSTNAME {
                return String::from_utf8(name.to_vec()).map_err(|_| SniError::InvalidHostname);
            }
        }
        return Err(SniError::NoSni);
    }

    Err(SniError::NoSni)
}

/// Lowercase, trim, strip one trailing dot, and enforce RFC 1035/1123
/// label rules. Returns `None` for invalid names.
pub fn normalize_hostname(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.len() > 253 {
        return None;
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return None;
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return None;
        }
    }
    Some(host)
}

/// Normalize a route pattern: an exact hostname or `*.parent`.
fn normalize_pattern(pattern: &str) -> Option<String> {
    let pattern = pattern.trim().to_ascii_lowercase();
    if let Some(rest) = pattern.strip_prefix("*.") {
        return normalize_hostname(rest).map(|host| format!("*.{host}"));
    }
    normalize_hostname(&pattern)
}

#[derive(Default)]
struct RouteTable {
    by_sni: HashMap<String, PortalId>,
    by_lease: HashMap<PortalId, String>,
}

/// SNI route registry. Registration de-duplicates by SNI (newest wins)
/// and by lease (a lease moving to a new SNI drops its old one).
#[derive(Default)]
pub struct SniRouter {
    routes: Mutex<RouteTable>,
}

impl SniRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` for `lease`. Returns false for an invalid
    /// pattern.
    pub fn register_route(&self, lease: PortalId, pattern: &str) -> bool {
        let Some(pattern) = normalize_pattern(pattern) else {
            return false;
        };

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(old_lease) = routes.by_sni.get(&pattern).cloned() {
            if old_lease != lease {
                routes.by_lease.remove(&old_lease);
            }
        }
        if let Some(old_pattern) = routes.by_lease.get(&lease).cloned() {
            routes.by_sni.remove(&old_pattern);
        }

        info!(%lease, %pattern, "sni route registered");
        routes.by_sni.insert(pattern.clone(), lease.clone());
        routes.by_lease.insert(lease, pattern);
        true
    }

    /// Cleanup hook called when a lease is destroyed.
    pub fn unregister_by_lease(&self, lease: &PortalId) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pattern) = routes.by_lease.remove(lease) {
            routes.by_sni.remove(&pattern);
            info!(%lease, %pattern, "sni route unregistered");
        }
    }

    /// Exact match wins; otherwise try the immediate parent wildcard only
    /// (`*.X` matches one extra label under `X`).
    pub fn match_route(&self, host: &str) -> Option<PortalId> {
        let host = normalize_hostname(host)?;
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(lease) = routes.by_sni.get(&host) {
            return Some(lease.clone());
        }

        let (_, parent) = host.split_once('.')?;
        routes.by_sni.get(&format!("*.{parent}")).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_sni
            .len()
    }
}

/// Accept TCP connections, peek the SNI under the deadline, and hand
/// matched connections to `on_connection`. Unmatched or unparseable
/// connections are closed with no diagnostic on the wire.
pub async fn accept_loop<F, Fut>(
    listener: TcpListener,
    router: Arc<SniRouter>,
    on_connection: F,
    mut stop: watch::Receiver<bool>,
) where
    F: Fn(PeekStream<TcpStream>, PortalId, std::net::SocketAddr) -> Fut
        + Clone
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("sni accept failed: {e}");
                    continue;
                }
            },
            _ = stop.changed() => {
                info!("sni accept loop stopping");
                return;
            }
        };

        let router = router.clone();
        let on_connection = on_connection.clone();
        tokio::spawn(async move {
            let peeked = tokio::time::timeout(SNI_PEEK_DEADLINE, peek_sni(stream)).await;
            let (wrapped, host) = match peeked {
                Ok((wrapped, Ok(host))) => (wrapped, host),
                Ok((_, Err(e))) => {
                    debug!(%peer, "sni peek failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "client hello deadline exceeded");
                    return;
                }
            };

            match router.match_route(&host) {
                Some(lease) => {
                    debug!(%peer, %host, %lease, "sni matched");
                    on_connection(wrapped, lease, peer).await;
                }
                None => {
                    debug!(%peer, %host, "no route for sni");
                }
            }
        });
    }
}
