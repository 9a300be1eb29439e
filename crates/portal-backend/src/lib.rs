//! Backend side of the Portal fabric.
//!
//! A backend opens one outbound connection to a relay, registers a lease
//! over the control stream, and then serves every client stream the relay
//! dispatches back over the same channel. Losing the channel loses the
//! lease; the backend re-registers on reconnect.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use portal_common::protocol::{
    self, ControlRequest, ControlResponse, LeaseSpec, LeaseStatus, StreamAccept, StreamOffer,
    CONTROL_ALPN,
};
use portal_core::channel::{ChannelError, Conn, SecureChannel};
use portal_core::framing::{read_record, write_record};
use portal_core::mux::{MuxHandle, MuxRole, MuxStream};
use portal_crypto::identity::Credential;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session closed")]
    Closed,
}

impl From<portal_common::Error> for BackendError {
    fn from(err: portal_common::Error) -> Self {
        BackendError::Protocol(err.to_string())
    }
}

/// A live backend session on a relay.
pub struct BackendSession {
    mux: MuxHandle,
    control: Mutex<MuxStream>,
}

impl BackendSession {
    /// Handshake over an already-connected transport and open the control
    /// stream. The relay learns our identity from the handshake binding.
    pub async fn connect<S: Conn + 'static>(
        stream: S,
        credential: &Credential,
        handshake_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let channel =
            SecureChannel::connect(stream, credential, CONTROL_ALPN, handshake_timeout).await?;
        info!(relay = %channel.remote_id(), "connected to relay");

        let mux = MuxHandle::start(Arc::new(channel), MuxRole::Initiator);
        let control = mux.open_stream().map_err(|_| BackendError::Closed)?;

        Ok(Self {
            mux,
            control: Mutex::new(control),
        })
    }

    async fn control_roundtrip(
        &self,
        request: &ControlRequest,
    ) -> Result<LeaseStatus, BackendError> {
        let mut control = self.control.lock().await;
        write_record(&mut *control, &protocol::encode(request)?).await?;
        let raw = read_record(&mut *control).await?;
        let response: ControlResponse = protocol::decode(&raw)?;
        Ok(response.status)
    }

    /// Register a lease. The returned status is `Ok` or a typed rejection.
    pub async fn register(&self, spec: LeaseSpec) -> Result<LeaseStatus, BackendError> {
        let status = self.control_roundtrip(&ControlRequest::Register(spec)).await?;
        debug!(?status, "lease registration answered");
        Ok(status)
    }

    /// Refresh (or atomically update) the lease held by this session.
    pub async fn refresh(&self, spec: LeaseSpec) -> Result<LeaseStatus, BackendError> {
        self.control_roundtrip(&ControlRequest::Refresh(spec)).await
    }

    /// Delete the lease. Idempotent.
    pub async fn delete(&self) -> Result<LeaseStatus, BackendError> {
        self.control_roundtrip(&ControlRequest::Delete).await
    }

    /// Wait for the next client stream the relay dispatches to us.
    /// Returns `None` once the session is gone.
    pub async fn next_incoming(&self) -> Option<IncomingStream> {
        loop {
            let mut stream = self.mux.accept_stream().await?;
            let offer = match read_record(&mut stream).await {
                Ok(raw) => match protocol::decode::<StreamOffer>(&raw) {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!("malformed stream offer: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    warn!("stream offer read failed: {e}");
                    continue;
                }
            };
            debug!(lease = %offer.lease_id, peer = %offer.peer_addr, "incoming stream");
            return Some(IncomingStream { offer, stream });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Tear the session down; the relay unregisters the lease.
    pub async fn close(&self) {
        self.mux.close().await;
    }

    /// Keep the lease alive by refreshing at two thirds of the TTL until
    /// the session dies. Takes ownership of a spec to resend verbatim.
    pub async fn run_refresh_loop(&self, spec: LeaseSpec, ttl: Duration) {
        let cadence = ttl.mul_f64(2.0 / 3.0).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            interval.tick().await;
            if self.is_closed() {
                return;
            }
            match self.refresh(spec.clone()).await {
                Ok(LeaseStatus::Ok) => {}
                Ok(status) => {
                    warn!(?status, "lease refresh rejected");
                    return;
                }
                Err(e) => {
                    warn!("lease refresh failed: {e}");
                    return;
                }
            }
        }
    }
}

/// A dispatched client stream awaiting accept/decline.
pub struct IncomingStream {
    pub offer: StreamOffer,
    stream: MuxStream,
}

impl IncomingStream {
    /// Accept the stream; raw client bytes flow after this.
    pub async fn accept(mut self) -> Result<MuxStream, BackendError> {
        let answer = protocol::encode(&StreamAccept { ok: true })?;
        write_record(&mut self.stream, &answer).await?;
        Ok(self.stream)
    }

    /// Decline the stream; the relay closes the client connection.
    pub async fn decline(mut self) -> Result<(), BackendError> {
        let answer = protocol::encode(&StreamAccept { ok: false })?;
        write_record(&mut self.stream, &answer).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
