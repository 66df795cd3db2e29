//! Typed payload layouts for each operation.
//!
//! Bodies are fixed big-endian fields followed, where noted, by raw
//! bytes. Layouts:
//!
//! - handshake guest request: program name bytes
//! - handshake fork request: 16-byte token + 4-byte cancel flag
//! - handshake response: 4-byte result code (0 = OK)
//! - syscall response: u32 error + 2x u64 return values + result bytes
//! - copy-in request: u64 addr + u64 len; response: the bytes
//! - copy-in-string request: u64 addr; response: the string bytes
//! - copy-out / copy-out-string request: u64 addr + bytes; no response
//! - anonymous-mmap request: u64 len; response: u64 addr
//! - prefork response: 16-byte token
//! - raise-signal: signal number in the header argument, empty body

use std::fmt;

use crate::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::header::WireError;

/// Result code in a successful handshake response body.
pub const HANDSHAKE_OK: u32 = 0;

/// Width of a pre-fork authentication token in bytes.
pub const TOKEN_LEN: usize = 16;

/// A pre-fork authentication token: a fixed-width random value handed to
/// the client by `Prefork` and presented back in a `Fork` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreforkToken(pub [u8; TOKEN_LEN]);

impl PreforkToken {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != TOKEN_LEN {
            return Err(WireError::ShortPayload {
                needed: TOKEN_LEN,
                got: bytes.len(),
            });
        }
        let mut raw = [0u8; TOKEN_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Display for PreforkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Body of a `Fork` handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkBody {
    pub token: PreforkToken,
    /// Set when the parent's OS-level fork failed and the pre-fork record
    /// should be discarded instead of claimed.
    pub cancel: bool,
}

impl ForkBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOKEN_LEN + 4);
        buf.extend_from_slice(&self.token.0);
        put_u32(&mut buf, self.cancel as u32);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let token = PreforkToken::from_slice(body.get(..TOKEN_LEN).ok_or(
            WireError::ShortPayload {
                needed: TOKEN_LEN + 4,
                got: body.len(),
            },
        )?)?;
        let cancel = get_u32(body, TOKEN_LEN)? != 0;
        if body.len() > TOKEN_LEN + 4 {
            return Err(WireError::TrailingPayload(body.len() - TOKEN_LEN - 4));
        }
        Ok(Self { token, cancel })
    }
}

/// Encodes a 4-byte handshake result code.
pub fn encode_result_code(code: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    put_u32(&mut buf, code);
    buf
}

/// Decodes a 4-byte handshake result code.
pub fn decode_result_code(body: &[u8]) -> Result<u32, WireError> {
    if body.len() != 4 {
        return Err(WireError::ShortPayload {
            needed: 4,
            got: body.len(),
        });
    }
    get_u32(body, 0)
}

/// A completed syscall: error code, up to two return values, and the
/// result bytes the dispatcher produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyscallReply {
    pub error: u32,
    pub retvals: [u64; 2],
    pub data: Vec<u8>,
}

impl SyscallReply {
    /// A successful reply carrying only result bytes.
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            error: 0,
            retvals: [0, 0],
            data,
        }
    }

    /// A failed reply carrying only an error code.
    pub fn failed(error: u32) -> Self {
        Self {
            error,
            retvals: [0, 0],
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.data.len());
        put_u32(&mut buf, self.error);
        put_u64(&mut buf, self.retvals[0]);
        put_u64(&mut buf, self.retvals[1]);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let error = get_u32(body, 0)?;
        let retvals = [get_u64(body, 4)?, get_u64(body, 12)?];
        Ok(Self {
            error,
            retvals,
            data: body[20..].to_vec(),
        })
    }
}

/// Body of a `CopyIn` request: read `len` bytes at `addr` in the client's
/// address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyInRequest {
    pub addr: u64,
    pub len: u64,
}

impl CopyInRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_u64(&mut buf, self.addr);
        put_u64(&mut buf, self.len);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() != 16 {
            return Err(WireError::ShortPayload {
                needed: 16,
                got: body.len(),
            });
        }
        Ok(Self {
            addr: get_u64(body, 0)?,
            len: get_u64(body, 8)?,
        })
    }
}

/// Body of a `CopyOut` or `CopyOutString` request: write `data` at `addr`
/// in the client's address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutRequest {
    pub addr: u64,
    pub data: Vec<u8>,
}

impl CopyOutRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data.len());
        put_u64(&mut buf, self.addr);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            addr: get_u64(body, 0)?,
            data: body[8..].to_vec(),
        })
    }
}

/// Body of an `AnonymousMmap` request: map `len` anonymous bytes in the
/// client's address space. The response body is the mapped address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRequest {
    pub len: u64,
}

impl MmapRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_u64(&mut buf, self.len);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() != 8 {
            return Err(WireError::ShortPayload {
                needed: 8,
                got: body.len(),
            });
        }
        Ok(Self {
            len: get_u64(body, 0)?,
        })
    }
}

/// Encodes a single address, used by `CopyInString` requests and
/// `AnonymousMmap` responses.
pub fn encode_addr(addr: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    put_u64(&mut buf, addr);
    buf
}

/// Decodes a single address body.
pub fn decode_addr(body: &[u8]) -> Result<u64, WireError> {
    if body.len() != 8 {
        return Err(WireError::ShortPayload {
            needed: 8,
            got: body.len(),
        });
    }
    get_u64(body, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_body_round_trip() {
        let body = ForkBody {
            token: PreforkToken([7u8; TOKEN_LEN]),
            cancel: false,
        };
        assert_eq!(ForkBody::decode(&body.encode()).unwrap(), body);

        let cancel = ForkBody {
            token: PreforkToken([1u8; TOKEN_LEN]),
            cancel: true,
        };
        assert_eq!(ForkBody::decode(&cancel.encode()).unwrap(), cancel);
    }

    #[test]
    fn test_fork_body_rejects_short_and_long() {
        assert!(ForkBody::decode(&[0u8; 10]).is_err());
        assert!(matches!(
            ForkBody::decode(&[0u8; 25]),
            Err(WireError::TrailingPayload(5))
        ));
    }

    #[test]
    fn test_syscall_reply_round_trip() {
        let reply = SyscallReply {
            error: 11,
            retvals: [0xDEAD, 0xBEEF],
            data: vec![1, 2, 3],
        };
        assert_eq!(SyscallReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_syscall_reply_minimum_size() {
        assert!(SyscallReply::decode(&[0u8; 19]).is_err());
        let empty = SyscallReply::ok(Vec::new());
        assert_eq!(empty.encode().len(), 20);
        assert_eq!(SyscallReply::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_copy_in_round_trip() {
        let req = CopyInRequest {
            addr: 0x1000,
            len: 4,
        };
        assert_eq!(CopyInRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_copy_out_round_trip() {
        let req = CopyOutRequest {
            addr: 0x2000,
            data: vec![9, 9, 9],
        };
        assert_eq!(CopyOutRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_result_code() {
        assert_eq!(
            decode_result_code(&encode_result_code(HANDSHAKE_OK)).unwrap(),
            HANDSHAKE_OK
        );
        assert!(decode_result_code(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_token_display_is_hex() {
        let token = PreforkToken([0xAB; TOKEN_LEN]);
        assert_eq!(token.to_string(), "ab".repeat(TOKEN_LEN));
    }
}
