//! Field codec for frame payloads.
//!
//! Action-specific payload fields are, in order: length-prefixed UTF-8
//! strings (u16 length), length-prefixed byte blocks (u32 length), booleans
//! (one byte, 0 or 1), and big-endian integers. Handlers read exactly the
//! fields the action defines; trailing bytes are ignored for forward
//! compatibility.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Status;
use crate::wire::{TokenStatus, WireError};

// ── Writer ───────────────────────────────────────────────────────────────────

/// Builds a payload field by field.
#[derive(Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reply payload: the status code comes first.
    pub fn reply(status: Status) -> Self {
        let mut w = Self::new();
        w.put_status(status);
        w
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        debug_assert!(s.len() <= u16::MAX as usize, "string field too long");
        self.buf.put_u16(s.len() as u16);
        self.buf.put_slice(s.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        debug_assert!(b.len() <= u32::MAX as usize);
        self.buf.put_u32(b.len() as u32);
        self.buf.put_slice(b);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_status(&mut self, status: Status) -> &mut Self {
        self.buf.put_u16(status as u16);
        self
    }

    pub fn put_token_status(&mut self, status: TokenStatus) -> &mut Self {
        self.buf.put_u8(status as u8);
        self
    }

    /// A list of strings: u16 count, then each length-prefixed.
    pub fn put_string_list<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.buf.put_u16(items.len() as u16);
        for item in items {
            self.put_string(item.as_ref());
        }
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Reads payload fields in order. Every accessor fails with
/// [`WireError::Truncated`] rather than panicking on short input.
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        if self.buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let len = self.buf.get_u16() as usize;
        if self.buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadString)
    }

    pub fn get_bytes(&mut self) -> Result<Bytes, WireError> {
        if self.buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        Ok(self.buf.split_to(len))
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        if self.buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        Ok(self.buf.get_u8() != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        if self.buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        if self.buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        Ok(self.buf.get_u32())
    }

    pub fn get_status(&mut self) -> Result<Status, WireError> {
        let code = self.get_u16()?;
        Status::try_from(code)
    }

    pub fn get_token_status(&mut self) -> Result<TokenStatus, WireError> {
        if self.buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        TokenStatus::try_from(self.buf.get_u8())
    }

    pub fn get_string_list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.get_u16()? as usize;
        let mut items = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            items.push(self.get_string()?);
        }
        Ok(items)
    }
}
