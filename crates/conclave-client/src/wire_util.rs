//! Small helpers for building request and one-way frames.

use conclave_core::payload::PayloadWriter;
use conclave_core::wire::{Action, Frame, ResourceKind};

/// Build a payload with the writer the closure fills in.
pub(crate) fn payload(build: impl FnOnce(&mut PayloadWriter)) -> bytes::Bytes {
    let mut w = PayloadWriter::new();
    build(&mut w);
    w.finish()
}

/// An uncorrelated frame (request id 0): manager handshake traffic.
pub(crate) fn one_way(
    session: u16,
    resource: ResourceKind,
    action: Action,
    build: impl FnOnce(&mut PayloadWriter),
) -> Frame {
    Frame::push(session, resource, action, payload(build))
}
