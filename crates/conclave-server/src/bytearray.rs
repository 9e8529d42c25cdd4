//! Shared byte-array: a named blob every joined client can read and
//! overwrite, with VALUE_CHANGED fan-out handled by the dispatcher.

use std::sync::Mutex;

use bytes::Bytes;
use conclave_core::wire::ResourceKind;

use crate::membership::Membership;

#[derive(Debug)]
pub struct ServerByteArray {
    pub membership: Membership,
    value: Mutex<(u64, Bytes)>,
}

impl ServerByteArray {
    pub fn new(session: u16, name: impl Into<String>, initial: Bytes) -> Self {
        Self {
            membership: Membership::new(ResourceKind::ByteArray, session, name),
            value: Mutex::new((0, initial)),
        }
    }

    pub fn value(&self) -> Bytes {
        self.value.lock().expect("value lock").1.clone()
    }

    /// Replace the value wholesale and bump the version. Last write wins;
    /// there is no compare-and-swap at this layer.
    pub fn set_value(&self, value: Bytes) -> u64 {
        let mut slot = self.value.lock().expect("value lock");
        slot.0 += 1;
        slot.1 = value;
        slot.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_replaced_wholesale() {
        let ba = ServerByteArray::new(1, "board", Bytes::from_static(b"init"));
        assert_eq!(ba.value(), Bytes::from_static(b"init"));
        assert_eq!(ba.set_value(Bytes::from_static(b"next")), 1);
        assert_eq!(ba.value(), Bytes::from_static(b"next"));
    }

    #[test]
    fn every_write_bumps_the_version() {
        let ba = ServerByteArray::new(1, "board", Bytes::new());
        assert_eq!(ba.set_value(Bytes::from_static(b"a")), 1);
        assert_eq!(ba.set_value(Bytes::from_static(b"b")), 2);
        assert_eq!(ba.set_value(Bytes::new()), 3);
        assert!(ba.value().is_empty());
    }
}
