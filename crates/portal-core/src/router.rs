//! Multipath router: concurrent transport paths, one active at a time.
//!
//! Each path is a reliable ordered datagram pipe. The router sends on the
//! current path (falling back to the first registered one before any
//! selection has happened), feeds receive samples to the
//! [`PathSelector`](crate::selector::PathSelector), and runs a background
//! tick that reaps idle paths and lets the selector switch.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::framing::{read_record, write_record};
use crate::selector::{PathId, PathSelector};

/// Paths quiet for longer than this are torn down by the update tick.
pub const PATH_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence of the background update tick.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Transport tuning knobs. Applied where the transport supports them;
/// `ack_no_delay` is meaningful only for transports that batch acks.
#[derive(Debug, Clone)]
pub struct PathConfig {
    pub no_delay: bool,
    pub mtu: usize,
    /// Socket buffer size in bytes; zero leaves the OS default.
    pub window: usize,
    pub ack_no_delay: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            mtu: 64 * 1024,
            window: 256 * 1024,
            ack_no_delay: true,
        }
    }
}

/// A reliable ordered datagram pipe under one path.
#[async_trait]
pub trait PathTransport: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;
    async fn recv(&self) -> io::Result<Vec<u8>>;
    async fn close(&self);
}

/// Length-framed datagrams over TCP: the shipped [`PathTransport`].
pub struct TcpPathTransport {
    read: Mutex<tokio::net::tcp::OwnedReadHalf>,
    write: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    mtu: usize,
}

impl TcpPathTransport {
    pub async fn dial(addr: std::net::SocketAddr, config: &PathConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(config.no_delay)?;

        if config.window > 0 {
            let sock = socket2::SockRef::from(&stream);
            sock.set_recv_buffer_size(config.window)?;
            sock.set_send_buffer_size(config.window)?;
        }

        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl PathTransport for TcpPathTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if datagram.len() > self.mtu {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds mtu {}", datagram.len(), self.mtu),
            ));
        }
        let mut write = self.write.lock().await;
        write_record(&mut *write, datagram).await
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut read = self.read.lock().await;
        read_record(&mut *read).await
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no path available")]
    PathUnavailable,

    #[error("router closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

struct PathEntry {
    transport: Arc<dyn PathTransport>,
    last_activity: Instant,
    last_latency_ns: u64,
}

/// Router over concurrent paths. Cheap to share behind an `Arc`; every
/// critical section is short and never spans I/O.
pub struct MultipathRouter {
    paths: StdMutex<HashMap<PathId, PathEntry>>,
    selector: StdMutex<PathSelector>,
    closed: AtomicBool,
}

impl Default for MultipathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipathRouter {
    pub fn new() -> Self {
        Self {
            paths: StdMutex::new(HashMap::new()),
            selector: StdMutex::new(PathSelector::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Dial a TCP-backed path and register it.
    pub async fn add_tcp_path(
        &self,
        id: PathId,
        addr: std::net::SocketAddr,
        config: &PathConfig,
    ) -> io::Result<()> {
        let transport = TcpPathTransport::dial(addr, config).await?;
        self.add_path(id, Arc::new(transport));
        Ok(())
    }

    /// Register an already-connected transport under `id`.
    pub fn add_path(&self, id: PathId, transport: Arc<dyn PathTransport>) {
        {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.insert(
                id,
                PathEntry {
                    transport,
                    last_activity: Instant::now(),
                    last_latency_ns: 0,
                },
            );
        }
        let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
        selector.add_path(id);
        info!(path = id, "path added");
    }

    /// Tear a path down. The selector forgets it; a current path simply
    /// stops being current and the next send falls back.
    pub async fn remove_path(&self, id: PathId) {
        let entry = {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.remove(&id)
        };
        {
            let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            selector.remove_path(id);
        }
        if let Some(entry) = entry {
            entry.transport.close().await;
            info!(path = id, "path removed");
        }
    }

    pub fn current_path(&self) -> Option<PathId> {
        self.selector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_path()
    }

    /// Send a datagram on the current path, or the first registered path
    /// when nothing has been selected yet. A send failure counts as a
    /// lost sample against that path.
    pub async fn send(&self, payload: &[u8]) -> Result<(), RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }

        // Snapshot the selection before touching the path table; the two
        // locks are never held together.
        let (current, order) = {
            let selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            (
                selector.current_path(),
                selector.path_ids().collect::<Vec<_>>(),
            )
        };

        let (id, transport) = {
            let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());

            let id = current
                .filter(|id| paths.contains_key(id))
                .or_else(|| order.into_iter().find(|id| paths.contains_key(id)))
                .ok_or(RouterError::PathUnavailable)?;

            (id, paths[&id].transport.clone())
        };

        match transport.send(payload).await {
            Ok(()) => {
                let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = paths.get_mut(&id) {
                    entry.last_activity = Instant::now();
                }
                Ok(())
            }
            Err(e) => {
                warn!(path = id, "send failed: {e}");
                let last_latency = {
                    let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
                    paths.get(&id).map(|p| p.last_latency_ns).unwrap_or(0)
                };
                let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
                selector.record_sample(id, last_latency, 0, true);
                Err(RouterError::Io(e))
            }
        }
    }

    /// Account a datagram received on `id` with the measured one-way
    /// latency. Jitter is the delta against the previous sample.
    pub fn receive_from(&self, id: PathId, payload: &[u8], latency_ns: u64) {
        let jitter = {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = paths.get_mut(&id) else {
                return;
            };
            entry.last_activity = Instant::now();
            let jitter = entry.last_latency_ns.abs_diff(latency_ns);
            let jitter = if entry.last_latency_ns == 0 { 0 } else { jitter };
            entry.last_latency_ns = latency_ns;
            jitter
        };

        let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
        selector.record_sample(id, latency_ns, jitter, false);
        debug!(path = id, bytes = payload.len(), latency_ns, "sample recorded");
    }

    /// Report a lost datagram on `id` (send timeout, missing ack).
    pub fn record_loss(&self, id: PathId) {
        let last_latency = {
            let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.get(&id).map(|p| p.last_latency_ns).unwrap_or(0)
        };
        let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
        selector.record_sample(id, last_latency, 0, true);
    }

    /// Operational override: switch immediately, bypassing cooldown and
    /// the improvement gate.
    pub fn force_switch(&self, id: PathId) -> bool {
        let exists = {
            let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.contains_key(&id)
        };
        if exists {
            let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            selector.switch_to(id);
        }
        exists
    }

    /// One maintenance pass: reap idle paths, then consult the selector.
    pub async fn update(&self) {
        let idle: Vec<PathId> = {
            let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths
                .iter()
                .filter(|(_, entry)| entry.last_activity.elapsed() > PATH_IDLE_TIMEOUT)
                .map(|(&id, _)| id)
                .collect()
        };
        for id in idle {
            info!(path = id, "reaping idle path");
            self.remove_path(id).await;
        }

        let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((best, true)) = selector.evaluate() {
            selector.switch_to(best);
        }
    }

    /// Run the update tick until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.update().await;
        }
    }

    /// Close every path and stop the update loop.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<Arc<dyn PathTransport>> = {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.drain().map(|(_, e)| e.transport).collect()
        };
        for transport in entries {
            transport.close().await;
        }
    }

    #[cfg(test)]
    fn backdate_activity(&self, id: PathId, by: Duration) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = paths.get_mut(&id) {
            entry.last_activity -= by;
        }
    }
}
