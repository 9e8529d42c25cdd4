//! conclave-client — typed proxies over a Conclave server connection.
//!
//! One [`ConclaveClient`] holds one stream connection and one identity.
//! Proxies ([`SessionProxy`], [`ByteArrayProxy`], [`ChannelProxy`],
//! [`TokenProxy`], [`RegistryProxy`]) translate method calls into
//! correlated frames; server pushes come back through the callback traits
//! in [`events`], each invocation on its own task.

pub mod events;

mod bytearray;
mod channel;
mod client;
mod handler;
mod membership;
mod registry;
mod session;
mod token;
mod wire_util;

pub use bytearray::ByteArrayProxy;
pub use channel::ChannelProxy;
pub use client::ConclaveClient;
pub use events::{
    AuthorizeRequest, ByteArrayEvents, ChannelConsumer, ClientIdentity, Decision, PlainIdentity,
    ResourceManager, SessionEvents, TokenEvents,
};
pub use registry::RegistryProxy;
pub use session::SessionProxy;
pub use token::TokenProxy;
