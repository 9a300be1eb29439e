//! Shared types for Portal: the error taxonomy and the control-message
//! protocol spoken between lease holders and the relay.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{ControlRequest, ControlResponse, LeaseSpec, LeaseStatus};
