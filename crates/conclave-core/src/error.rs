//! Protocol error taxonomy and its wire representation.
//!
//! Every reply frame carries a [`Status`] as its first payload field. The
//! calling-side proxy turns a non-Ok status into the corresponding
//! [`ProtocolError`] for its caller.

use crate::wire::WireError;

// ── Status codes ─────────────────────────────────────────────────────────────

/// Result code in a reply frame. Stable across client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Ok = 0x00,
    NotBound = 0x01,
    AlreadyBound = 0x02,
    NoSuchSession = 0x03,
    NoSuchClient = 0x04,
    NoSuchByteArray = 0x05,
    NoSuchChannel = 0x06,
    NoSuchToken = 0x07,
    NoSuchListener = 0x08,
    NameInUse = 0x09,
    PermissionDenied = 0x0A,
    ManagerExists = 0x0B,
    ClientNotGrabbing = 0x0C,
    ClientNotReleased = 0x0D,
    ConnectionFailure = 0x0E,
    TimedOut = 0x0F,
    InvalidUrl = 0x10,
    InvalidClient = 0x11,
    AuthorizationInProgress = 0x12,
}

impl TryFrom<u16> for Status {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        Ok(match value {
            0x00 => Status::Ok,
            0x01 => Status::NotBound,
            0x02 => Status::AlreadyBound,
            0x03 => Status::NoSuchSession,
            0x04 => Status::NoSuchClient,
            0x05 => Status::NoSuchByteArray,
            0x06 => Status::NoSuchChannel,
            0x07 => Status::NoSuchToken,
            0x08 => Status::NoSuchListener,
            0x09 => Status::NameInUse,
            0x0A => Status::PermissionDenied,
            0x0B => Status::ManagerExists,
            0x0C => Status::ClientNotGrabbing,
            0x0D => Status::ClientNotReleased,
            0x0E => Status::ConnectionFailure,
            0x0F => Status::TimedOut,
            0x10 => Status::InvalidUrl,
            0x11 => Status::InvalidClient,
            0x12 => Status::AuthorizationInProgress,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }
}

impl Status {
    /// Ok becomes `Ok(())`; anything else becomes the matching error.
    pub fn into_result(self) -> Result<(), ProtocolError> {
        match ProtocolError::from_status(self) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

// ── Protocol errors ──────────────────────────────────────────────────────────

/// Failures a resource operation can report, mirroring [`Status`] one for
/// one (minus `Ok`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("name is not bound")]
    NotBound,
    #[error("name is already bound")]
    AlreadyBound,
    #[error("no such session")]
    NoSuchSession,
    #[error("no such client")]
    NoSuchClient,
    #[error("no such byte-array")]
    NoSuchByteArray,
    #[error("no such channel")]
    NoSuchChannel,
    #[error("no such token")]
    NoSuchToken,
    #[error("no such listener")]
    NoSuchListener,
    #[error("client name already in use")]
    NameInUse,
    #[error("permission denied")]
    PermissionDenied,
    #[error("a manager is already attached")]
    ManagerExists,
    #[error("client is not grabbing the token")]
    ClientNotGrabbing,
    #[error("client has not released the token")]
    ClientNotReleased,
    #[error("connection failure")]
    ConnectionFailure,
    #[error("timed out waiting for reply")]
    TimedOut,
    #[error("malformed url")]
    InvalidUrl,
    #[error("malformed client identity")]
    InvalidClient,
    #[error("an authorization is already pending for this client")]
    AuthorizationInProgress,
}

impl ProtocolError {
    /// The wire status for this error.
    pub fn status(&self) -> Status {
        use ProtocolError::*;
        match self {
            NotBound => Status::NotBound,
            AlreadyBound => Status::AlreadyBound,
            NoSuchSession => Status::NoSuchSession,
            NoSuchClient => Status::NoSuchClient,
            NoSuchByteArray => Status::NoSuchByteArray,
            NoSuchChannel => Status::NoSuchChannel,
            NoSuchToken => Status::NoSuchToken,
            NoSuchListener => Status::NoSuchListener,
            NameInUse => Status::NameInUse,
            PermissionDenied => Status::PermissionDenied,
            ManagerExists => Status::ManagerExists,
            ClientNotGrabbing => Status::ClientNotGrabbing,
            ClientNotReleased => Status::ClientNotReleased,
            ConnectionFailure => Status::ConnectionFailure,
            TimedOut => Status::TimedOut,
            InvalidUrl => Status::InvalidUrl,
            InvalidClient => Status::InvalidClient,
            AuthorizationInProgress => Status::AuthorizationInProgress,
        }
    }

    /// `None` for `Status::Ok`, the matching error otherwise.
    pub fn from_status(status: Status) -> Option<Self> {
        use ProtocolError::*;
        Some(match status {
            Status::Ok => return None,
            Status::NotBound => NotBound,
            Status::AlreadyBound => AlreadyBound,
            Status::NoSuchSession => NoSuchSession,
            Status::NoSuchClient => NoSuchClient,
            Status::NoSuchByteArray => NoSuchByteArray,
            Status::NoSuchChannel => NoSuchChannel,
            Status::NoSuchToken => NoSuchToken,
            Status::NoSuchListener => NoSuchListener,
            Status::NameInUse => NameInUse,
            Status::PermissionDenied => PermissionDenied,
            Status::ManagerExists => ManagerExists,
            Status::ClientNotGrabbing => ClientNotGrabbing,
            Status::ClientNotReleased => ClientNotReleased,
            Status::ConnectionFailure => ConnectionFailure,
            Status::TimedOut => TimedOut,
            Status::InvalidUrl => InvalidUrl,
            Status::InvalidClient => InvalidClient,
            Status::AuthorizationInProgress => AuthorizationInProgress,
        })
    }
}

/// A request payload that cannot be parsed is answered `InvalidClient` —
/// the wire status for a malformed request body.
impl From<WireError> for ProtocolError {
    fn from(_: WireError) -> Self {
        ProtocolError::InvalidClient
    }
}
