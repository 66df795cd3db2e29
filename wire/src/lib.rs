//! # Wire Protocol
//!
//! This crate defines the SysRelay wire protocol: the fixed-size frame
//! header, the tagged header argument, the incremental frame decoder, the
//! typed payload layouts, and the connection banner.
//!
//! ## Philosophy
//!
//! - **Fixed layout, not self-describing**: every integer is big-endian at
//!   a known offset; both ends agree on the layout up front
//! - **Typed, not union-typed**: the 4-byte header argument is a tagged sum
//!   in memory, a raw `u32` only on the wire
//! - **Incremental**: the decoder tolerates one byte at a time and never
//!   assumes a read boundary aligns with a frame boundary
//! - **No I/O**: this crate touches byte slices only

pub mod banner;
mod bytes;
pub mod frame;
pub mod header;
pub mod payload;

pub use banner::{
    format_banner, parse_banner, Banner, MAX_BANNER_LEN, PROTOCOL_ID, PROTOCOL_MAJOR,
    PROTOCOL_MINOR,
};
pub use frame::{encode_frame, Frame, FrameDecoder};
pub use header::{
    ErrorCode, HandshakeKind, Header, HeaderArg, MessageClass, MessageKind, WireError, HEADER_LEN,
};
pub use payload::{
    decode_addr, decode_result_code, encode_addr, encode_result_code, CopyInRequest,
    CopyOutRequest, ForkBody, MmapRequest, PreforkToken, SyscallReply, HANDSHAKE_OK, TOKEN_LEN,
};
