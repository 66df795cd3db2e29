//! Frame header layout and the tagged header argument.
//!
//! Every frame starts with a 24-byte header:
//!
//! ```text
//! u64 length      total frame length, header included
//! u64 request_no  correlation number, unique while outstanding
//! u16 class       0=Request 1=Response 2=Error
//! u16 kind        operation discriminant
//! u32 argument    meaning keyed by (class, kind); see `HeaderArg`
//! ```
//!
//! The 4-byte argument field carries four unrelated meanings on the wire
//! (syscall number, error code, handshake kind, signal number). In memory
//! it is the `HeaderArg` sum type; the raw `u32` exists only at the codec
//! boundary.

use std::fmt;
use thiserror::Error;

use crate::bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 24;

/// Errors raised by the wire codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame length smaller than the header itself.
    #[error("frame length {length} is shorter than the {HEADER_LEN}-byte header")]
    ShortFrame { length: u64 },

    /// Unknown message class discriminant.
    #[error("unknown message class {0}")]
    UnknownClass(u16),

    /// Unknown message kind discriminant.
    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    /// Unknown handshake sub-kind.
    #[error("unknown handshake kind {0}")]
    UnknownHandshakeKind(u32),

    /// Unknown error code in an error frame.
    #[error("unknown error code {0}")]
    UnknownErrorCode(u32),

    /// Payload shorter than its fixed fields require.
    #[error("payload too short: needed {needed} bytes, got {got}")]
    ShortPayload { needed: usize, got: usize },

    /// Payload longer than its layout allows.
    #[error("payload has {0} trailing bytes")]
    TrailingPayload(usize),

    /// Malformed connection banner.
    #[error("malformed banner: {0}")]
    BadBanner(String),

    /// Banner from an incompatible protocol major version.
    #[error("incompatible protocol version {major}.{minor}")]
    VersionMismatch { major: u32, minor: u32 },
}

/// Message class: which direction of the request/response exchange a
/// frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// A new request awaiting a response.
    Request,
    /// A successful response to an earlier request.
    Response,
    /// A failure response carrying an `ErrorCode`.
    Error,
}

impl MessageClass {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Error => 2,
        }
    }

    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Message kind: the operation a frame performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Syscall,
    CopyIn,
    CopyInString,
    CopyOut,
    CopyOutString,
    AnonymousMmap,
    Prefork,
    RaiseSignal,
}

impl MessageKind {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Handshake => 0,
            Self::Syscall => 1,
            Self::CopyIn => 2,
            Self::CopyInString => 3,
            Self::CopyOut => 4,
            Self::CopyOutString => 5,
            Self::AnonymousMmap => 6,
            Self::Prefork => 7,
            Self::RaiseSignal => 8,
        }
    }

    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Syscall),
            2 => Some(Self::CopyIn),
            3 => Some(Self::CopyInString),
            4 => Some(Self::CopyOut),
            5 => Some(Self::CopyOutString),
            6 => Some(Self::AnonymousMmap),
            7 => Some(Self::Prefork),
            8 => Some(Self::RaiseSignal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Handshake => "handshake",
            Self::Syscall => "syscall",
            Self::CopyIn => "copy-in",
            Self::CopyInString => "copy-in-string",
            Self::CopyOut => "copy-out",
            Self::CopyOutString => "copy-out-string",
            Self::AnonymousMmap => "anonymous-mmap",
            Self::Prefork => "prefork",
            Self::RaiseSignal => "raise-signal",
        };
        f.write_str(label)
    }
}

/// Handshake sub-kind, carried in the header argument of a handshake
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeKind {
    /// Fresh client; the body is the program name.
    Guest,
    /// Reserved for authenticated handshakes.
    Auth,
    /// Forked child reclaiming a pre-forked context; the body is a
    /// 16-byte token plus a 4-byte cancel flag.
    Fork,
    /// Post-exec process image resuming its existing session; no body.
    ExecContinuation,
}

impl HandshakeKind {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Guest => 0,
            Self::Auth => 1,
            Self::Fork => 2,
            Self::ExecContinuation => 3,
        }
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Guest),
            1 => Some(Self::Auth),
            2 => Some(Self::Fork),
            3 => Some(Self::ExecContinuation),
            _ => None,
        }
    }
}

/// Application-level error codes carried by `MessageClass::Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Server worker pool saturated; the caller may retry.
    TryAgain,
    /// Handshake was not acceptable; the sender closes the socket.
    AuthFailure,
    /// Fork handshake presented a token with no matching record.
    InvalidPreforkToken,
    /// The hosting runtime failed to fork an execution context.
    ForkFailed,
    /// The session is mid-exec and cannot service the request.
    InExec,
    /// A request buffer could not be sized; the frame was discarded.
    OutOfMemory,
    /// The request was not valid for the session's state; the sender
    /// closes the socket.
    MalformedRequest,
}

impl ErrorCode {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::TryAgain => 1,
            Self::AuthFailure => 2,
            Self::InvalidPreforkToken => 3,
            Self::ForkFailed => 4,
            Self::InExec => 5,
            Self::OutOfMemory => 6,
            Self::MalformedRequest => 7,
        }
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::TryAgain),
            2 => Some(Self::AuthFailure),
            3 => Some(Self::InvalidPreforkToken),
            4 => Some(Self::ForkFailed),
            5 => Some(Self::InExec),
            6 => Some(Self::OutOfMemory),
            7 => Some(Self::MalformedRequest),
            _ => None,
        }
    }

    /// Whether the side that sent this code also closes the socket.
    pub fn closes_session(self) -> bool {
        matches!(self, Self::AuthFailure | Self::MalformedRequest)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TryAgain => "try again",
            Self::AuthFailure => "authentication failure",
            Self::InvalidPreforkToken => "invalid prefork token",
            Self::ForkFailed => "fork failed",
            Self::InExec => "exec in progress",
            Self::OutOfMemory => "out of memory",
            Self::MalformedRequest => "malformed request",
        };
        f.write_str(label)
    }
}

/// Typed view of the 4-byte header argument.
///
/// The wire reuses one `u32` for four unrelated meanings; which one
/// applies is keyed by `(class, kind)`:
///
/// - any `Error` frame carries an `ErrorCode`
/// - `Handshake` frames carry the `HandshakeKind`
/// - `Syscall` requests carry the syscall number
/// - `RaiseSignal` requests carry the signal number
/// - everything else carries nothing (encoded as zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderArg {
    None,
    Syscall(u32),
    Fault(ErrorCode),
    Handshake(HandshakeKind),
    Signal(u32),
}

impl HeaderArg {
    fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Syscall(number) => number,
            Self::Fault(code) => code.to_u32(),
            Self::Handshake(kind) => kind.to_u32(),
            Self::Signal(signo) => signo,
        }
    }

    fn from_u32(class: MessageClass, kind: MessageKind, raw: u32) -> Result<Self, WireError> {
        if class == MessageClass::Error {
            return ErrorCode::from_u32(raw)
                .map(Self::Fault)
                .ok_or(WireError::UnknownErrorCode(raw));
        }
        match kind {
            MessageKind::Handshake => HandshakeKind::from_u32(raw)
                .map(Self::Handshake)
                .ok_or(WireError::UnknownHandshakeKind(raw)),
            MessageKind::Syscall if class == MessageClass::Request => Ok(Self::Syscall(raw)),
            MessageKind::RaiseSignal if class == MessageClass::Request => Ok(Self::Signal(raw)),
            _ => Ok(Self::None),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total frame length, header included.
    pub length: u64,
    /// Correlation number; monotonic per session generation.
    pub request_no: u64,
    pub class: MessageClass,
    pub kind: MessageKind,
    pub arg: HeaderArg,
}

impl Header {
    /// Builds a request header for a body of `body_len` bytes.
    pub fn request(request_no: u64, kind: MessageKind, arg: HeaderArg, body_len: usize) -> Self {
        Self {
            length: (HEADER_LEN + body_len) as u64,
            request_no,
            class: MessageClass::Request,
            kind,
            arg,
        }
    }

    /// Builds a success response to `request`.
    pub fn response_to(request: &Header, body_len: usize) -> Self {
        Self {
            length: (HEADER_LEN + body_len) as u64,
            request_no: request.request_no,
            class: MessageClass::Response,
            kind: request.kind,
            arg: match request.arg {
                HeaderArg::Handshake(kind) => HeaderArg::Handshake(kind),
                _ => HeaderArg::None,
            },
        }
    }

    /// Builds an error response to `request`.
    pub fn error_to(request: &Header, code: ErrorCode) -> Self {
        Self {
            length: HEADER_LEN as u64,
            request_no: request.request_no,
            class: MessageClass::Error,
            kind: request.kind,
            arg: HeaderArg::Fault(code),
        }
    }

    /// Body length implied by the frame length.
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }

    /// Encodes the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        put_u64(&mut buf, self.length);
        put_u64(&mut buf, self.request_no);
        put_u16(&mut buf, self.class.to_u16());
        put_u16(&mut buf, self.kind.to_u16());
        put_u32(&mut buf, self.arg.to_u32());
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a header from exactly `HEADER_LEN` bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let length = get_u64(buf, 0)?;
        if length < HEADER_LEN as u64 {
            return Err(WireError::ShortFrame { length });
        }
        let request_no = get_u64(buf, 8)?;
        let raw_class = get_u16(buf, 16)?;
        let class = MessageClass::from_u16(raw_class).ok_or(WireError::UnknownClass(raw_class))?;
        let raw_kind = get_u16(buf, 18)?;
        let kind = MessageKind::from_u16(raw_kind).ok_or(WireError::UnknownKind(raw_kind))?;
        let arg = HeaderArg::from_u32(class, kind, get_u32(buf, 20)?)?;
        Ok(Self {
            length,
            request_no,
            class,
            kind,
            arg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_discriminants_round_trip() {
        for class in [
            MessageClass::Request,
            MessageClass::Response,
            MessageClass::Error,
        ] {
            assert_eq!(MessageClass::from_u16(class.to_u16()), Some(class));
        }
        assert_eq!(MessageClass::from_u16(3), None);
    }

    #[test]
    fn test_kind_discriminants_round_trip() {
        for raw in 0..=8u16 {
            let kind = MessageKind::from_u16(raw).unwrap();
            assert_eq!(kind.to_u16(), raw);
        }
        assert_eq!(MessageKind::from_u16(9), None);
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header::request(7, MessageKind::Syscall, HeaderArg::Syscall(42), 10);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.body_len(), 10);
    }

    #[test]
    fn test_error_header_carries_code() {
        let request = Header::request(3, MessageKind::Prefork, HeaderArg::None, 0);
        let error = Header::error_to(&request, ErrorCode::TryAgain);
        let decoded = Header::decode(&error.encode()).unwrap();
        assert_eq!(decoded.arg, HeaderArg::Fault(ErrorCode::TryAgain));
        assert_eq!(decoded.request_no, 3);
    }

    #[test]
    fn test_short_length_rejected() {
        let mut buf = Header::request(1, MessageKind::Handshake, HeaderArg::Handshake(HandshakeKind::Guest), 0)
            .encode();
        buf[..8].copy_from_slice(&10u64.to_be_bytes());
        assert_eq!(
            Header::decode(&buf),
            Err(WireError::ShortFrame { length: 10 })
        );
    }

    #[test]
    fn test_unknown_handshake_kind_rejected() {
        let mut buf = Header::request(1, MessageKind::Handshake, HeaderArg::Handshake(HandshakeKind::Guest), 0)
            .encode();
        buf[20..24].copy_from_slice(&9u32.to_be_bytes());
        assert_eq!(Header::decode(&buf), Err(WireError::UnknownHandshakeKind(9)));
    }

    #[test]
    fn test_handshake_response_echoes_kind() {
        let request = Header::request(
            5,
            MessageKind::Handshake,
            HeaderArg::Handshake(HandshakeKind::Fork),
            20,
        );
        let response = Header::response_to(&request, 4);
        assert_eq!(response.arg, HeaderArg::Handshake(HandshakeKind::Fork));
        assert_eq!(response.body_len(), 4);
    }
}
