//! conclave-server — shared-object state and protocol handlers.
//!
//! The server hosts a registry (session number 0) and any number of
//! sessions, each holding byte-arrays, channels, and tokens. Every
//! operation arrives as a frame on some client's connection and is routed
//! by [`dispatch::ServerHandler`].

pub mod authorize;
pub mod bytearray;
pub mod channel;
pub mod connections;
pub mod dispatch;
pub mod membership;
pub mod registry;
pub mod serve;
pub mod session;
pub mod state;
pub mod token;

pub use dispatch::ServerHandler;
pub use state::ServerState;
