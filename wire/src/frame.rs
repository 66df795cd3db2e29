//! Frame encoding and the incremental decoder.
//!
//! Encoding is a straight concatenation of the 24-byte header and the
//! body. Decoding is incremental: the decoder accepts byte chunks of any
//! size (down to a single byte), accumulates the header first, sizes the
//! body from the header's length field, and yields complete frames in
//! arrival order. Bytes left over after a complete frame begin the next
//! one, so a read boundary never has to align with a frame boundary.

use std::collections::VecDeque;

use crate::header::{Header, WireError, HEADER_LEN};

/// One complete frame: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
    /// The body exceeded the decoder's limit and was discarded. The
    /// header is intact and the stream is still synchronized; `body` is
    /// empty. The receiver answers `out-of-memory` instead of buffering.
    pub oversized: bool,
}

impl Frame {
    /// Encodes the frame into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(&self.header, &self.body)
    }
}

/// Encodes a header and body into wire bytes.
///
/// The header's length field must already account for the body; the
/// `Header` constructors guarantee this.
pub fn encode_frame(header: &Header, body: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.length as usize, HEADER_LEN + body.len());
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    out
}

enum DecodeStage {
    /// Accumulating the first `HEADER_LEN` bytes.
    Header { buf: Vec<u8> },
    /// Header complete; accumulating the body.
    Body { header: Header, buf: Vec<u8> },
    /// Body over the limit; counting down the bytes to throw away.
    Discard { header: Header, remaining: u64 },
}

/// Incremental frame decoder.
///
/// Feed it whatever a read returned; pop complete frames with
/// [`FrameDecoder::next_frame`]. A decode error is fatal for the stream:
/// the decoder makes no attempt to resynchronize.
pub struct FrameDecoder {
    stage: DecodeStage,
    body_limit: Option<usize>,
    ready: VecDeque<Frame>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            stage: DecodeStage::Header { buf: Vec::new() },
            body_limit: None,
            ready: VecDeque::new(),
        }
    }

    /// Caps the body size; larger frames are consumed in discard mode and
    /// surface with `oversized` set.
    pub fn with_body_limit(limit: usize) -> Self {
        let mut decoder = Self::new();
        decoder.body_limit = Some(limit);
        decoder
    }

    /// True between frames: no header or body bytes are pending.
    pub fn is_idle(&self) -> bool {
        matches!(&self.stage, DecodeStage::Header { buf } if buf.is_empty())
    }

    /// Consumes a chunk of stream bytes. All bytes are always consumed;
    /// completed frames queue up for [`FrameDecoder::next_frame`].
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<(), WireError> {
        while !bytes.is_empty() {
            match &mut self.stage {
                DecodeStage::Header { buf } => {
                    let take = (HEADER_LEN - buf.len()).min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == HEADER_LEN {
                        let header = Header::decode(buf)?;
                        self.begin_body(header);
                    }
                }
                DecodeStage::Body { header, buf } => {
                    let want = header.body_len() - buf.len();
                    let take = want.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == header.body_len() {
                        let frame = Frame {
                            header: *header,
                            body: std::mem::take(buf),
                            oversized: false,
                        };
                        self.ready.push_back(frame);
                        self.stage = DecodeStage::Header { buf: Vec::new() };
                    }
                }
                DecodeStage::Discard { header, remaining } => {
                    let take = (*remaining).min(bytes.len() as u64) as usize;
                    *remaining -= take as u64;
                    bytes = &bytes[take..];
                    if *remaining == 0 {
                        let frame = Frame {
                            header: *header,
                            body: Vec::new(),
                            oversized: true,
                        };
                        self.ready.push_back(frame);
                        self.stage = DecodeStage::Header { buf: Vec::new() };
                    }
                }
            }
        }
        Ok(())
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    fn begin_body(&mut self, header: Header) {
        let body_len = header.body_len();
        let over = self.body_limit.map(|limit| body_len > limit).unwrap_or(false);
        if over {
            self.stage = DecodeStage::Discard {
                header,
                remaining: body_len as u64,
            };
        } else if body_len == 0 {
            self.ready.push_back(Frame {
                header,
                body: Vec::new(),
                oversized: false,
            });
            self.stage = DecodeStage::Header { buf: Vec::new() };
        } else {
            self.stage = DecodeStage::Body {
                header,
                buf: Vec::with_capacity(body_len),
            };
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ErrorCode, HandshakeKind, HeaderArg, MessageKind};

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame {
                header: Header::request(
                    1,
                    MessageKind::Handshake,
                    HeaderArg::Handshake(HandshakeKind::Guest),
                    4,
                ),
                body: b"test".to_vec(),
                oversized: false,
            },
            Frame {
                header: Header::request(2, MessageKind::Syscall, HeaderArg::Syscall(5), 2),
                body: vec![0x01, 0x02],
                oversized: false,
            },
            Frame {
                header: Header::request(3, MessageKind::Prefork, HeaderArg::None, 0),
                body: Vec::new(),
                oversized: false,
            },
        ]
    }

    #[test]
    fn test_round_trip_single_chunk() {
        let mut decoder = FrameDecoder::new();
        for frame in sample_frames() {
            decoder.feed(&frame.encode()).unwrap();
            assert_eq!(decoder.next_frame().unwrap(), frame);
        }
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_round_trip_one_byte_at_a_time() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();
        let mut decoder = FrameDecoder::new();
        for byte in stream {
            decoder.feed(&[byte]).unwrap();
        }
        for expected in frames {
            assert_eq!(decoder.next_frame().unwrap(), expected);
        }
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_round_trip_odd_chunk_sizes() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();
        for chunk in [3usize, 7, 23, 25, 64] {
            let mut decoder = FrameDecoder::new();
            for piece in stream.chunks(chunk) {
                decoder.feed(piece).unwrap();
            }
            let decoded: Vec<Frame> = std::iter::from_fn(|| decoder.next_frame()).collect();
            assert_eq!(decoded, frames, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let frames = sample_frames();
        let mut stream = frames[0].encode();
        stream.extend_from_slice(&frames[1].encode());
        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream).unwrap();
        assert_eq!(decoder.next_frame().unwrap(), frames[0]);
        assert_eq!(decoder.next_frame().unwrap(), frames[1]);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_short_length_is_protocol_error() {
        let mut buf = Header::request(1, MessageKind::Syscall, HeaderArg::Syscall(0), 0).encode();
        buf[..8].copy_from_slice(&5u64.to_be_bytes());
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.feed(&buf),
            Err(WireError::ShortFrame { length: 5 })
        );
    }

    #[test]
    fn test_oversized_body_discarded_but_synchronized() {
        let big = Frame {
            header: Header::request(9, MessageKind::Syscall, HeaderArg::Syscall(1), 100),
            body: vec![0xAA; 100],
            oversized: false,
        };
        let follow = Frame {
            header: Header::request(10, MessageKind::Prefork, HeaderArg::None, 0),
            body: Vec::new(),
            oversized: false,
        };
        let mut stream = big.encode();
        stream.extend_from_slice(&follow.encode());

        let mut decoder = FrameDecoder::with_body_limit(16);
        decoder.feed(&stream).unwrap();

        let first = decoder.next_frame().unwrap();
        assert!(first.oversized);
        assert!(first.body.is_empty());
        assert_eq!(first.header.request_no, 9);

        // The stream is still aligned: the next frame decodes normally.
        assert_eq!(decoder.next_frame().unwrap(), follow);
    }

    #[test]
    fn test_error_frame_decodes() {
        let request = Header::request(4, MessageKind::Syscall, HeaderArg::Syscall(0), 0);
        let error = Frame {
            header: Header::error_to(&request, ErrorCode::MalformedRequest),
            body: Vec::new(),
            oversized: false,
        };
        let mut decoder = FrameDecoder::new();
        decoder.feed(&error.encode()).unwrap();
        let decoded = decoder.next_frame().unwrap();
        assert_eq!(
            decoded.header.arg,
            HeaderArg::Fault(ErrorCode::MalformedRequest)
        );
    }
}
