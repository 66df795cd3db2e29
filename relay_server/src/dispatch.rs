//! Inbound request dispatch.
//!
//! Every frame a session reader decodes with class `Request` lands here.
//! What is legal depends on the session's state: a `New` session may
//! only handshake; a `Running` session may prefork, exec-continue, and
//! issue syscalls. Anything else is answered and, where the protocol
//! demands it, the session is closed.

use std::sync::{Arc, OnceLock, Weak};

use relay_log::Logger;
use session::{InboundHandler, Session, SessionState};
use wire::payload::{encode_result_code, ForkBody};
use wire::{
    ErrorCode, Frame, HandshakeKind, Header, HeaderArg, MessageKind, SyscallReply, HANDSHAKE_OK,
};

use crate::callback::SessionMemory;
use crate::host::KernelHost;
use crate::pool::WorkerPool;
use crate::prefork::PreforkTable;
use crate::registry::{ServerSession, SessionRegistry};

/// The server's request dispatcher, shared by every session reader.
pub struct ServerHandler {
    registry: Arc<SessionRegistry>,
    preforks: Arc<PreforkTable>,
    pool: Arc<WorkerPool>,
    host: Arc<dyn KernelHost>,
    log: Logger,
    /// Back-reference handed to workers so their nested callbacks can
    /// participate in the reader discipline.
    self_handle: OnceLock<Weak<ServerHandler>>,
}

impl ServerHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        preforks: Arc<PreforkTable>,
        pool: Arc<WorkerPool>,
        host: Arc<dyn KernelHost>,
        log: Logger,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            registry,
            preforks,
            pool,
            host,
            log,
            self_handle: OnceLock::new(),
        });
        let _ = handler.self_handle.set(Arc::downgrade(&handler));
        handler
    }

    fn worker_handler(&self) -> Arc<dyn InboundHandler> {
        match self.self_handle.get().and_then(Weak::upgrade) {
            Some(handler) => handler as Arc<dyn InboundHandler>,
            None => Arc::new(IgnoreInbound),
        }
    }

    fn reply_ok(&self, session: &Arc<Session>, request: &Header, body: &[u8]) {
        let header = Header::response_to(request, body.len());
        if session.send_frame(&header, body).is_err() {
            self.log.debug("response dropped: session is gone");
        }
    }

    /// Answers with an error frame. Codes that the protocol couples to a
    /// close (auth-failure, malformed-request) also tear the session
    /// down.
    fn reply_error(&self, session: &Arc<Session>, request: &Header, code: ErrorCode) {
        let header = Header::error_to(request, code);
        let _ = session.send_frame(&header, &[]);
        if code.closes_session() {
            session.close();
        }
    }

    fn handle_handshake(
        &self,
        entry: &Arc<ServerSession>,
        session: &Arc<Session>,
        frame: &Frame,
    ) {
        match frame.header.arg {
            HeaderArg::Handshake(HandshakeKind::Guest) => {
                let program = match String::from_utf8(frame.body.clone()) {
                    Ok(program) => program,
                    Err(_) => {
                        self.reply_error(session, &frame.header, ErrorCode::MalformedRequest);
                        return;
                    }
                };
                match self.host.spawn_guest(&program) {
                    Ok(context) => {
                        entry.bind_context(context);
                        session.set_state(SessionState::Running);
                        self.log.info(format!(
                            "guest {program:?} attached as {context}"
                        ));
                        self.reply_ok(session, &frame.header, &encode_result_code(HANDSHAKE_OK));
                    }
                    Err(error) => {
                        self.log.warn(format!("guest handshake failed: {error}"));
                        self.reply_error(session, &frame.header, ErrorCode::AuthFailure);
                    }
                }
            }
            HeaderArg::Handshake(HandshakeKind::Fork) => {
                let fork = match ForkBody::decode(&frame.body) {
                    Ok(fork) => fork,
                    Err(_) => {
                        self.reply_error(session, &frame.header, ErrorCode::MalformedRequest);
                        return;
                    }
                };
                match self.preforks.claim(&fork.token) {
                    None => {
                        // An unknown token is an authentication failure;
                        // the session does not survive it.
                        self.reply_error(session, &frame.header, ErrorCode::InvalidPreforkToken);
                        session.close();
                    }
                    Some(context) if fork.cancel => {
                        // The client's own fork failed; retire the
                        // record and the context it reserved.
                        self.host.release(context);
                        self.reply_ok(session, &frame.header, &encode_result_code(HANDSHAKE_OK));
                        session.close();
                    }
                    Some(context) => {
                        entry.bind_context(context);
                        session.set_state(SessionState::Running);
                        self.log.info(format!("forked child attached to {context}"));
                        self.reply_ok(session, &frame.header, &encode_result_code(HANDSHAKE_OK));
                    }
                }
            }
            _ => self.reply_error(session, &frame.header, ErrorCode::AuthFailure),
        }
    }

    fn handle_exec(&self, entry: &Arc<ServerSession>, session: &Arc<Session>, frame: &Frame) {
        if entry.in_exec() {
            self.reply_error(session, &frame.header, ErrorCode::InExec);
            return;
        }
        entry.set_in_exec(true);

        // The reader must keep demultiplexing while in-flight syscalls
        // finish, so the drain happens off-thread.
        let entry_thread = Arc::clone(entry);
        let session_conn = Arc::clone(session);
        let host = Arc::clone(&self.host);
        let log = self.log.clone();
        let request = frame.header;
        let spawned = std::thread::Builder::new()
            .name("relay-exec".to_string())
            .spawn(move || {
                entry_thread.wait_workers_drained();
                if let Some(context) = entry_thread.context() {
                    host.exec_notify(context);
                    log.info(format!("exec continuation on {context}"));
                }
                let body = encode_result_code(HANDSHAKE_OK);
                let header = Header::response_to(&request, body.len());
                let _ = session_conn.send_frame(&header, &body);
                entry_thread.set_in_exec(false);
            });
        if spawned.is_err() {
            entry.set_in_exec(false);
            self.reply_error(session, &frame.header, ErrorCode::TryAgain);
        }
    }

    fn handle_prefork(&self, entry: &Arc<ServerSession>, session: &Arc<Session>, frame: &Frame) {
        if entry.in_exec() {
            self.reply_error(session, &frame.header, ErrorCode::InExec);
            return;
        }
        let Some(context) = entry.context() else {
            self.reply_error(session, &frame.header, ErrorCode::MalformedRequest);
            return;
        };
        match self.host.fork_context(context) {
            Err(error) => {
                self.log.warn(format!("prefork on {context} failed: {error}"));
                self.reply_error(session, &frame.header, ErrorCode::ForkFailed);
            }
            Ok(child) => {
                let (token, evicted) = self.preforks.insert(child);
                if let Some(stale) = evicted {
                    self.log.warn(format!(
                        "prefork table over capacity, discarding stale record for {stale}"
                    ));
                    self.host.release(stale);
                }
                self.reply_ok(session, &frame.header, token.as_bytes());
            }
        }
    }

    fn handle_syscall(&self, entry: &Arc<ServerSession>, session: &Arc<Session>, frame: Frame) {
        let HeaderArg::Syscall(number) = frame.header.arg else {
            self.reply_error(session, &frame.header, ErrorCode::MalformedRequest);
            return;
        };
        if entry.in_exec() {
            self.reply_error(session, &frame.header, ErrorCode::InExec);
            return;
        }
        let Some(context) = entry.context() else {
            self.reply_error(session, &frame.header, ErrorCode::MalformedRequest);
            return;
        };

        entry.worker_begin();
        let job = {
            let entry = Arc::clone(entry);
            let session = Arc::clone(session);
            let host = Arc::clone(&self.host);
            let handler = self.worker_handler();
            let request = frame.header;
            let args = frame.body;
            Box::new(move || {
                let memory = SessionMemory::new(Arc::clone(&session), handler);
                let reply: SyscallReply = host.syscall(context, number, &args, &memory);
                let body = reply.encode();
                let header = Header::response_to(&request, body.len());
                let _ = session.send_frame(&header, &body);
                entry.worker_end();
            })
        };
        if self.pool.submit(job).is_err() {
            entry.worker_end();
            self.reply_error(session, &frame.header, ErrorCode::TryAgain);
        }
    }
}

impl InboundHandler for ServerHandler {
    fn on_request(&self, session: &Arc<Session>, frame: Frame) {
        let Some(entry) = self.registry.get(session.id()) else {
            // Teardown already removed this session; drop the frame.
            return;
        };
        if frame.oversized {
            self.reply_error(session, &frame.header, ErrorCode::OutOfMemory);
            return;
        }
        match (session.state(), frame.header.kind) {
            (SessionState::New, MessageKind::Handshake) => {
                self.handle_handshake(&entry, session, &frame)
            }
            // A session that has not handshaken gets nothing else.
            (SessionState::New, _) => {
                self.reply_error(session, &frame.header, ErrorCode::AuthFailure)
            }
            (SessionState::Running, MessageKind::Handshake) => match frame.header.arg {
                HeaderArg::Handshake(HandshakeKind::ExecContinuation) => {
                    self.handle_exec(&entry, session, &frame)
                }
                _ => self.reply_error(session, &frame.header, ErrorCode::MalformedRequest),
            },
            (SessionState::Running, MessageKind::Prefork) => {
                self.handle_prefork(&entry, session, &frame)
            }
            (SessionState::Running, MessageKind::Syscall) => {
                self.handle_syscall(&entry, session, frame)
            }
            (SessionState::Running, _) => {
                self.reply_error(session, &frame.header, ErrorCode::MalformedRequest)
            }
            (SessionState::Dying, _) => {}
        }
    }
}

struct IgnoreInbound;

impl InboundHandler for IgnoreInbound {
    fn on_request(&self, _session: &Arc<Session>, _frame: Frame) {}
}
