//! Reverse-callback client.
//!
//! While a worker services a syscall, the dispatcher may need the remote
//! caller's memory or signal delivery. [`SessionMemory`] issues those as
//! nested requests over the same session the syscall arrived on and
//! parks the worker on the pending wait; the session's reader resolves
//! it when the client answers. Copy-out and signal delivery are
//! fire-and-forget: they correlate a request number (so a stray reply
//! matches and is discarded) but never wait.

use std::sync::Arc;

use session::{InboundHandler, Session, SessionError};
use thiserror::Error;
use wire::payload::{self, CopyInRequest, CopyOutRequest, MmapRequest};
use wire::{ErrorCode, Header, HeaderArg, MessageKind, WireError};

/// Failure of a nested callback against the remote client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// The session died before the callback completed.
    #[error("client not connected")]
    NotConnected,

    /// The client answered with an error frame.
    #[error("client error: {0}")]
    Remote(ErrorCode),

    /// The client's reply violated the payload layout.
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
}

impl From<SessionError> for CallbackError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Remote(code) => Self::Remote(code),
            SessionError::Protocol(error) => Self::Protocol(error),
            SessionError::NotConnected | SessionError::Closed | SessionError::Io(_) => {
                Self::NotConnected
            }
        }
    }
}

/// The remote caller's address space, as seen by a syscall dispatcher.
pub trait RemoteMemory {
    /// Reads `len` bytes at `addr`; blocks for the reply.
    fn copy_in(&self, addr: u64, len: u64) -> Result<Vec<u8>, CallbackError>;

    /// Reads a zero-terminated string at `addr`; blocks for the reply.
    fn copy_in_string(&self, addr: u64) -> Result<Vec<u8>, CallbackError>;

    /// Writes `data` at `addr`; does not wait for acknowledgement.
    fn copy_out(&self, addr: u64, data: &[u8]) -> Result<(), CallbackError>;

    /// Writes a string at `addr`; does not wait for acknowledgement.
    fn copy_out_string(&self, addr: u64, data: &[u8]) -> Result<(), CallbackError>;

    /// Maps `len` anonymous bytes; blocks for the mapped address.
    fn anon_mmap(&self, len: u64) -> Result<u64, CallbackError>;

    /// Delivers a signal to the remote caller; does not wait.
    fn raise_signal(&self, signo: u32) -> Result<(), CallbackError>;
}

/// [`RemoteMemory`] bound to one live session.
pub struct SessionMemory {
    session: Arc<Session>,
    handler: Arc<dyn InboundHandler>,
}

impl SessionMemory {
    pub fn new(session: Arc<Session>, handler: Arc<dyn InboundHandler>) -> Self {
        Self { session, handler }
    }

    /// Nested blocking request: register a wait, send, park until the
    /// reader resolves it. The single-reader/multi-waiter discipline is
    /// the same one the client uses, so a worker that ever finds the
    /// reader role unclaimed pumps frames itself rather than deadlock.
    fn call(
        &self,
        kind: MessageKind,
        arg: HeaderArg,
        body: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        let wait = self.session.begin_request();
        let header = Header::request(wait.request_no(), kind, arg, body.len());
        if let Err(error) = self.session.send_frame(&header, body) {
            self.session.forget_wait(wait.request_no());
            return Err(error.into());
        }
        Ok(self.session.await_reply(&wait, &self.handler)?)
    }

    /// Fire-and-forget request: a request number is still assigned so a
    /// reply, if the client ever sends one, correlates and is discarded
    /// as untracked.
    fn send_only(
        &self,
        kind: MessageKind,
        arg: HeaderArg,
        body: &[u8],
    ) -> Result<(), CallbackError> {
        let request_no = self.session.next_request_no();
        let header = Header::request(request_no, kind, arg, body.len());
        self.session.send_frame(&header, body)?;
        Ok(())
    }
}

impl RemoteMemory for SessionMemory {
    fn copy_in(&self, addr: u64, len: u64) -> Result<Vec<u8>, CallbackError> {
        let body = CopyInRequest { addr, len }.encode();
        self.call(MessageKind::CopyIn, HeaderArg::None, &body)
    }

    fn copy_in_string(&self, addr: u64) -> Result<Vec<u8>, CallbackError> {
        let body = payload::encode_addr(addr);
        self.call(MessageKind::CopyInString, HeaderArg::None, &body)
    }

    fn copy_out(&self, addr: u64, data: &[u8]) -> Result<(), CallbackError> {
        let body = CopyOutRequest {
            addr,
            data: data.to_vec(),
        }
        .encode();
        self.send_only(MessageKind::CopyOut, HeaderArg::None, &body)
    }

    fn copy_out_string(&self, addr: u64, data: &[u8]) -> Result<(), CallbackError> {
        let body = CopyOutRequest {
            addr,
            data: data.to_vec(),
        }
        .encode();
        self.send_only(MessageKind::CopyOutString, HeaderArg::None, &body)
    }

    fn anon_mmap(&self, len: u64) -> Result<u64, CallbackError> {
        let reply = self.call(
            MessageKind::AnonymousMmap,
            HeaderArg::None,
            &MmapRequest { len }.encode(),
        )?;
        Ok(payload::decode_addr(&reply)?)
    }

    fn raise_signal(&self, signo: u32) -> Result<(), CallbackError> {
        self.send_only(MessageKind::RaiseSignal, HeaderArg::Signal(signo), &[])
    }
}
