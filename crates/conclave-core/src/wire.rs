//! Conclave wire format — on-wire types for all Conclave communication.
//!
//! These types ARE the protocol. Every field, every code, every marker byte
//! is part of the wire format; changing anything here is a breaking change
//! for every deployed peer.
//!
//! The fixed frame header is #[repr(C, packed)] with big-endian integer
//! fields for deterministic layout and uses zerocopy derives for safe,
//! allocation-free serialization. There is no unsafe code in this module.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame header ─────────────────────────────────────────────────────────────

/// Marker byte preceding the protocol version. `b'V'`.
pub const VERSION_MARKER: u8 = b'V';

/// Marker byte preceding the session number. `b'S'`.
pub const SESSION_MARKER: u8 = b'S';

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Session number reserved for registry-scope traffic.
pub const REGISTRY_SESSION: u16 = 0;

/// The fixed header preceding every frame, on both the stream and the
/// datagram transports.
///
/// Wire size: 13 bytes, big-endian throughout.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always [`VERSION_MARKER`]. A receiver seeing anything else drops the
    /// connection — the stream is not speaking this protocol.
    pub version_marker: u8,

    /// Protocol version. Currently [`PROTOCOL_VERSION`].
    pub version: u8,

    /// Always [`SESSION_MARKER`].
    pub session_marker: u8,

    /// Session number. 0 is reserved for registry-scope traffic.
    pub session: U16<BigEndian>,

    /// Request id, unique per sending connection. 0 for unsolicited pushes.
    pub request_id: U32<BigEndian>,

    /// Resource type code — see [`ResourceKind`].
    pub resource: U16<BigEndian>,

    /// Action code — see [`Action`].
    pub action: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 13]);

/// Header length in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Maximum encoded frame size (header + payload) accepted by a receiver.
pub const MAX_FRAME: usize = 1 << 20;

// ── Resource type codes ──────────────────────────────────────────────────────

/// Resource type tag in the frame header.
///
/// Stable across client and server; matched exhaustively, never compared
/// numerically outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ResourceKind {
    ByteArray = 0x01,
    Channel = 0x02,
    Session = 0x03,
    Token = 0x04,
    Client = 0x05,
    Registry = 0x06,
    Manager = 0x07,
}

impl TryFrom<u16> for ResourceKind {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ResourceKind::ByteArray),
            0x02 => Ok(ResourceKind::Channel),
            0x03 => Ok(ResourceKind::Session),
            0x04 => Ok(ResourceKind::Token),
            0x05 => Ok(ResourceKind::Client),
            0x06 => Ok(ResourceKind::Registry),
            0x07 => Ok(ResourceKind::Manager),
            other => Err(WireError::UnknownResource(other)),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::ByteArray => "byte-array",
            ResourceKind::Channel => "channel",
            ResourceKind::Session => "session",
            ResourceKind::Token => "token",
            ResourceKind::Client => "client",
            ResourceKind::Registry => "registry",
            ResourceKind::Manager => "manager",
        };
        f.write_str(s)
    }
}

// ── Action codes ─────────────────────────────────────────────────────────────

/// Action tag in the frame header.
///
/// Grouped by the resource family that defines them; generic actions apply
/// to every manageable resource. All codes fit in the low byte — the
/// correlation key packing relies on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Action {
    // Generic, shared by every manageable resource.
    Join = 0x01,
    Leave = 0x02,
    Invite = 0x03,
    Expel = 0x04,
    AddListener = 0x05,
    RemoveListener = 0x06,
    AttachManager = 0x07,
    IsManaged = 0x08,
    ChangeManagerMask = 0x09,
    Authenticate = 0x0A,
    Challenge = 0x0B,
    ListClientNames = 0x0C,

    // Byte-array.
    Create = 0x10,
    Destroy = 0x11,
    SetValue = 0x12,
    ValueChanged = 0x13,

    // Channel.
    AddConsumer = 0x18,
    RemoveConsumer = 0x19,
    Send = 0x1A,
    DataReceived = 0x1B,
    ListConsumerNames = 0x1C,

    // Token.
    Grab = 0x20,
    Release = 0x21,
    Give = 0x22,
    TokenGiven = 0x23,
    Request = 0x24,
    Test = 0x25,
    ListHolderNames = 0x26,

    // Session.
    CreateByteArray = 0x30,
    CreateChannel = 0x31,
    CreateToken = 0x32,
    ByteArrayExists = 0x33,
    ChannelExists = 0x34,
    TokenExists = 0x35,
    ByteArrayJoined = 0x36,
    ChannelJoined = 0x37,
    TokenJoined = 0x38,
    ListByteArrayNames = 0x39,
    ListChannelNames = 0x3A,
    ListTokenNames = 0x3B,
    Close = 0x3C,

    // Registry.
    Bind = 0x40,
    Unbind = 0x41,
    Lookup = 0x42,
    List = 0x43,
    GetSessionNumber = 0x44,
    IsAlive = 0x45,
    Exists = 0x46,
    Stop = 0x47,

    // Manager handshake and server-pushed events.
    Authorize = 0x50,
    Joined = 0x51,
    Left = 0x52,
    Invited = 0x53,
    Expelled = 0x54,
    Destroyed = 0x55,
    Released = 0x56,
    Requested = 0x57,
}

impl TryFrom<u16> for Action {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use Action::*;
        Ok(match value {
            0x01 => Join,
            0x02 => Leave,
            0x03 => Invite,
            0x04 => Expel,
            0x05 => AddListener,
            0x06 => RemoveListener,
            0x07 => AttachManager,
            0x08 => IsManaged,
            0x09 => ChangeManagerMask,
            0x0A => Authenticate,
            0x0B => Challenge,
            0x0C => ListClientNames,
            0x10 => Create,
            0x11 => Destroy,
            0x12 => SetValue,
            0x13 => ValueChanged,
            0x18 => AddConsumer,
            0x19 => RemoveConsumer,
            0x1A => Send,
            0x1B => DataReceived,
            0x1C => ListConsumerNames,
            0x20 => Grab,
            0x21 => Release,
            0x22 => Give,
            0x23 => TokenGiven,
            0x24 => Request,
            0x25 => Test,
            0x26 => ListHolderNames,
            0x30 => CreateByteArray,
            0x31 => CreateChannel,
            0x32 => CreateToken,
            0x33 => ByteArrayExists,
            0x34 => ChannelExists,
            0x35 => TokenExists,
            0x36 => ByteArrayJoined,
            0x37 => ChannelJoined,
            0x38 => TokenJoined,
            0x39 => ListByteArrayNames,
            0x3A => ListChannelNames,
            0x3B => ListTokenNames,
            0x3C => Close,
            0x40 => Bind,
            0x41 => Unbind,
            0x42 => Lookup,
            0x43 => List,
            0x44 => GetSessionNumber,
            0x45 => IsAlive,
            0x46 => Exists,
            0x47 => Stop,
            0x50 => Authorize,
            0x51 => Joined,
            0x52 => Left,
            0x53 => Invited,
            0x54 => Expelled,
            0x55 => Destroyed,
            0x56 => Released,
            0x57 => Requested,
            other => return Err(WireError::UnknownAction(other)),
        })
    }
}

// ── Event masks ──────────────────────────────────────────────────────────────

/// Listener event mask bits.
///
/// A listener receives an event only when the corresponding bit is set in
/// its registered mask. Managers register a mask the same way.
pub type EventMask = u16;

pub mod event_mask {
    use super::EventMask;

    pub const JOINED: EventMask = 1 << 0;
    pub const LEFT: EventMask = 1 << 1;
    pub const INVITED: EventMask = 1 << 2;
    pub const EXPELLED: EventMask = 1 << 3;
    pub const DESTROYED: EventMask = 1 << 4;
    pub const VALUE_CHANGED: EventMask = 1 << 5;
    pub const RELEASED: EventMask = 1 << 6;
    pub const GIVEN: EventMask = 1 << 7;
    pub const REQUESTED: EventMask = 1 << 8;
    pub const ALL: EventMask = 0x01FF;
}

// ── Token status ─────────────────────────────────────────────────────────────

/// The four states of the token mutual-exclusion machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenStatus {
    NotInUse = 0x01,
    Inhibited = 0x02,
    Grabbed = 0x03,
    Giving = 0x04,
}

impl TryFrom<u8> for TokenStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TokenStatus::NotInUse),
            0x02 => Ok(TokenStatus::Inhibited),
            0x03 => Ok(TokenStatus::Grabbed),
            0x04 => Ok(TokenStatus::Giving),
            other => Err(WireError::UnknownTokenStatus(other)),
        }
    }
}

// ── Correlation key ──────────────────────────────────────────────────────────

/// Identifies one request/reply pair on a connection.
///
/// The tuple (request id, session number, resource type, action) packed
/// into a single u64 for cheap comparison:
///
/// ```text
/// bits 63..32  request id
/// bits 31..16  session number
/// bits 15..8   resource code (low byte — all codes fit)
/// bits  7..0   action code   (low byte — all codes fit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey(u64);

impl CorrelationKey {
    pub fn pack(request_id: u32, session: u16, resource: ResourceKind, action: Action) -> Self {
        let packed = (u64::from(request_id) << 32)
            | (u64::from(session) << 16)
            | ((resource as u64 & 0xFF) << 8)
            | (action as u64 & 0xFF);
        CorrelationKey(packed)
    }

    pub fn of(frame: &Frame) -> Self {
        Self::pack(frame.request_id, frame.session, frame.resource, frame.action)
    }

    pub fn request_id(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A decoded frame: the header fields plus the action-specific payload.
///
/// The payload is opaque at this layer; [`crate::payload`] provides the
/// field codec the handlers use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session: u16,
    pub request_id: u32,
    pub resource: ResourceKind,
    pub action: Action,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        session: u16,
        request_id: u32,
        resource: ResourceKind,
        action: Action,
        payload: Bytes,
    ) -> Self {
        Self {
            session,
            request_id,
            resource,
            action,
            payload,
        }
    }

    /// An unsolicited push (request id 0).
    pub fn push(session: u16, resource: ResourceKind, action: Action, payload: Bytes) -> Self {
        Self::new(session, 0, resource, action, payload)
    }

    /// A reply mirrors the request's header fields exactly — that is what
    /// the caller's correlation key matches on.
    pub fn reply_to(request: &Frame, payload: Bytes) -> Self {
        Self::new(
            request.session,
            request.request_id,
            request.resource,
            request.action,
            payload,
        )
    }

    /// Encode header + payload. The stream transport prepends its own
    /// length prefix; the datagram transport sends this verbatim.
    pub fn encode(&self) -> Bytes {
        let header = FrameHeader {
            version_marker: VERSION_MARKER,
            version: PROTOCOL_VERSION,
            session_marker: SESSION_MARKER,
            session: U16::new(self.session),
            request_id: U32::new(self.request_id),
            resource: U16::new(self.resource as u16),
            action: U16::new(self.action as u16),
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode header + payload from a complete frame buffer.
    pub fn decode(mut buf: Bytes) -> Result<Frame, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let header = FrameHeader::read_from(&buf[..HEADER_LEN]).ok_or(WireError::Truncated)?;
        if header.version_marker != VERSION_MARKER || header.session_marker != SESSION_MARKER {
            return Err(WireError::BadMarker);
        }
        if header.version != PROTOCOL_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let resource = ResourceKind::try_from(header.resource.get())?;
        let action = Action::try_from(header.action.get())?;
        let session = header.session.get();
        let request_id = header.request_id.get();
        buf.advance(HEADER_LEN);
        Ok(Frame {
            session,
            request_id,
            resource,
            action,
            payload: buf,
        })
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame shorter than its declared contents")]
    Truncated,

    #[error("bad header marker bytes")]
    BadMarker,

    #[error("unknown protocol version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown resource code: 0x{0:04x}")]
    UnknownResource(u16),

    #[error("unknown action code: 0x{0:04x}")]
    UnknownAction(u16),

    #[error("unknown token status: 0x{0:02x}")]
    UnknownTokenStatus(u8),

    #[error("unknown status code: 0x{0:04x}")]
    UnknownStatus(u16),

    #[error("string field is not valid UTF-8")]
    BadString,

    #[error("field too long for its length prefix: {0} bytes")]
    FieldTooLong(usize),

    #[error("frame length {0} exceeds maximum {MAX_FRAME}")]
    FrameTooLarge(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
