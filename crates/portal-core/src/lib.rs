//! Portal core: the secure session and forwarding plumbing.
//!
//! This crate provides:
//! - Length-framed record I/O over any reliable stream
//! - The secure channel (Noise XX transport with framing, fragmentation,
//!   and concurrent full-duplex access)
//! - A minimal stream multiplexer for per-client substreams
//! - Token-bucket rate limiting and metered copying
//! - The multipath path selector and router
//!
//! Everything here treats its input as `reliable ordered byte stream`;
//! listeners, TLS termination, and the admin surface live elsewhere.

#![forbid(unsafe_code)]

pub mod channel;
pub mod framing;
pub mod limiter;
pub mod mux;
pub mod pool;
pub mod router;
pub mod selector;

pub use channel::{ChannelError, SecureChannel};
pub use limiter::{copy, TokenBucket};
pub use mux::{MuxHandle, MuxRole, MuxStream};
pub use router::{MultipathRouter, PathConfig, PathTransport};
pub use selector::{PathId, PathSelector};
