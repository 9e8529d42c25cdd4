//! conclave-core — wire format, protocol codes, errors, and configuration.
//! All other Conclave crates depend on this one.

pub mod config;
pub mod error;
pub mod payload;
pub mod url;
pub mod wire;

pub use error::{ProtocolError, Status};
pub use wire::{Action, CorrelationKey, EventMask, Frame, ResourceKind, TokenStatus};
