//! Local address-space bridge for reverse callbacks.
//!
//! While a syscall executes remotely, the server may issue requests back
//! over the same session: read or write the caller's memory, map
//! anonymous memory, or deliver a signal. The session's reader hands
//! those inbound frames to [`BridgeHandler`], which services them
//! synchronously against the hosting runtime's [`MemoryBridge`].

use std::sync::Arc;

use relay_log::Logger;
use session::{InboundHandler, Session};
use thiserror::Error;
use wire::payload::{self, CopyInRequest, CopyOutRequest, MmapRequest};
use wire::{ErrorCode, Frame, Header, HeaderArg, MessageKind};

/// Failure inside the local address-space bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("address space fault: {0}")]
pub struct BridgeFault(pub String);

/// The client-side surface reverse callbacks run against.
///
/// Implemented by the hosting runtime over its real address space; tests
/// substitute a table of simulated regions.
pub trait MemoryBridge: Send + Sync {
    fn copy_in(&self, addr: u64, len: u64) -> Result<Vec<u8>, BridgeFault>;
    fn copy_in_string(&self, addr: u64) -> Result<Vec<u8>, BridgeFault>;
    fn copy_out(&self, addr: u64, data: &[u8]) -> Result<(), BridgeFault>;
    fn copy_out_string(&self, addr: u64, data: &[u8]) -> Result<(), BridgeFault>;
    fn anon_mmap(&self, len: u64) -> Result<u64, BridgeFault>;
    fn raise_signal(&self, signo: u32) -> Result<(), BridgeFault>;
}

/// Adapts a [`MemoryBridge`] to the session's inbound-request seam.
pub struct BridgeHandler {
    bridge: Arc<dyn MemoryBridge>,
    log: Logger,
}

impl BridgeHandler {
    pub fn new(bridge: Arc<dyn MemoryBridge>, log: Logger) -> Self {
        Self { bridge, log }
    }

    fn serve(&self, frame: &Frame) -> Result<Option<Vec<u8>>, ServeError> {
        let body = frame.body.as_slice();
        match frame.header.kind {
            MessageKind::CopyIn => {
                let request = CopyInRequest::decode(body)?;
                let data = self.bridge.copy_in(request.addr, request.len)?;
                Ok(Some(data))
            }
            MessageKind::CopyInString => {
                let addr = payload::decode_addr(body)?;
                let data = self.bridge.copy_in_string(addr)?;
                Ok(Some(data))
            }
            MessageKind::CopyOut => {
                let request = CopyOutRequest::decode(body)?;
                self.bridge.copy_out(request.addr, &request.data)?;
                Ok(None)
            }
            MessageKind::CopyOutString => {
                let request = CopyOutRequest::decode(body)?;
                self.bridge.copy_out_string(request.addr, &request.data)?;
                Ok(None)
            }
            MessageKind::AnonymousMmap => {
                let request = MmapRequest::decode(body)?;
                let addr = self.bridge.anon_mmap(request.len)?;
                Ok(Some(payload::encode_addr(addr)))
            }
            MessageKind::RaiseSignal => {
                let signo = match frame.header.arg {
                    HeaderArg::Signal(signo) => signo,
                    _ => return Err(ServeError::NotACallback),
                };
                self.bridge.raise_signal(signo)?;
                Ok(None)
            }
            // A server never legitimately sends these to a client.
            MessageKind::Handshake | MessageKind::Syscall | MessageKind::Prefork => {
                Err(ServeError::NotACallback)
            }
        }
    }
}

enum ServeError {
    Malformed(wire::WireError),
    Fault(BridgeFault),
    NotACallback,
}

impl From<wire::WireError> for ServeError {
    fn from(error: wire::WireError) -> Self {
        Self::Malformed(error)
    }
}

impl From<BridgeFault> for ServeError {
    fn from(error: BridgeFault) -> Self {
        Self::Fault(error)
    }
}

impl InboundHandler for BridgeHandler {
    fn on_request(&self, session: &Arc<Session>, frame: Frame) {
        if frame.oversized {
            let reply = Header::error_to(&frame.header, ErrorCode::OutOfMemory);
            let _ = session.send_frame(&reply, &[]);
            return;
        }
        match self.serve(&frame) {
            Ok(Some(body)) => {
                let reply = Header::response_to(&frame.header, body.len());
                let _ = session.send_frame(&reply, &body);
            }
            // Copy-out and signal delivery are fire-and-forget: the
            // server does not wait, so no reply is sent.
            Ok(None) => {}
            Err(failure) => {
                let message = match &failure {
                    ServeError::Malformed(error) => format!(
                        "malformed {} callback: {error}",
                        frame.header.kind
                    ),
                    ServeError::Fault(fault) => {
                        format!("{} callback failed: {fault}", frame.header.kind)
                    }
                    ServeError::NotACallback => {
                        format!("unexpected inbound {} request", frame.header.kind)
                    }
                };
                self.log.warn(message);
                let reply = Header::error_to(&frame.header, ErrorCode::MalformedRequest);
                let _ = session.send_frame(&reply, &[]);
                // Malformed-request answers close the connection.
                session.close();
            }
        }
    }
}
