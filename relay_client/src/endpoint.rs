//! The client endpoint.
//!
//! Lifecycle: `Disconnected → Connecting → Handshaking → Running`, with
//! `Reconnecting → Handshaking → Running` loops under automatic retry,
//! ending in `Closed`.

use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use relay_log::Logger;
use session::{
    default_substrate, InboundHandler, Session, SessionError, SessionState, WaitSubstrate,
};
use thiserror::Error;
use transport::{Endpoint, RelayStream, TransportError};
use wire::payload::{decode_result_code, ForkBody, PreforkToken, SyscallReply};
use wire::{
    parse_banner, ErrorCode, HandshakeKind, Header, HeaderArg, MessageKind, WireError,
    HANDSHAKE_OK, MAX_BANNER_LEN,
};

use crate::bridge::{BridgeHandler, MemoryBridge};
use crate::config::{ClientConfig, RetryPolicy};
use crate::exec::ExecEnv;

/// Interval between progress log entries while a reconnect loop runs.
const RECONNECT_PROGRESS_INTERVAL: Duration = Duration::from_secs(120);

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No connection, and reconnection (if enabled) was exhausted.
    #[error("not connected")]
    NotConnected,

    /// Failure establishing the underlying connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    /// The server answered with an error frame; the session survives
    /// unless the code says otherwise.
    #[error("server error: {0}")]
    Remote(ErrorCode),

    /// The server answered the handshake with a nonzero result code.
    #[error("handshake refused with code {0}")]
    HandshakeRefused(u32),

    /// The operation is not available on this platform or state.
    #[error("{0}")]
    Unsupported(String),
}

impl From<SessionError> for ClientError {
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

/// Client endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Running,
    Reconnecting,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A client endpoint: one logical session to a relay server, over which
/// syscalls execute remotely.
///
/// All methods take `&self`; the endpoint is shared freely across
/// threads and serializes internally where the protocol demands it.
pub struct RelayClient {
    config: ClientConfig,
    session: Arc<Session>,
    handler: Arc<dyn InboundHandler>,
    substrate: Arc<dyn WaitSubstrate>,
    state: Mutex<ClientState>,
    /// Serializes reconnection so exactly one thread rebuilds the
    /// session while the rest wait for the outcome.
    reconnect_gate: Mutex<()>,
    log: Logger,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayClient {
    /// Connects, validates the banner, and performs the guest handshake.
    pub fn connect(
        config: ClientConfig,
        bridge: Arc<dyn MemoryBridge>,
    ) -> Result<Self, ClientError> {
        Self::connect_with(config, bridge, default_substrate(), Logger::stderr("relay-client"))
    }

    /// As [`RelayClient::connect`] with an explicit blocking substrate
    /// and logger.
    pub fn connect_with(
        config: ClientConfig,
        bridge: Arc<dyn MemoryBridge>,
        substrate: Arc<dyn WaitSubstrate>,
        log: Logger,
    ) -> Result<Self, ClientError> {
        let client = Self::detached(config, bridge, substrate, log);
        client.set_state(ClientState::Connecting);
        let stream = client.dial()?;
        client.session.attach(stream).map_err(ClientError::from)?;
        client.set_state(ClientState::Handshaking);
        match client.guest_handshake() {
            Ok(()) => {
                client.mark_running();
                Ok(client)
            }
            Err(error) => {
                client.session.close();
                Err(error)
            }
        }
    }

    /// Builds the endpoint without touching the network. Used by the
    /// fork/exec continuation constructors.
    fn detached(
        config: ClientConfig,
        bridge: Arc<dyn MemoryBridge>,
        substrate: Arc<dyn WaitSubstrate>,
        log: Logger,
    ) -> Self {
        let session = Session::new(
            Arc::clone(&substrate),
            Some(config.max_frame_body),
            log.scoped("session"),
        );
        let handler: Arc<dyn InboundHandler> =
            Arc::new(BridgeHandler::new(bridge, log.scoped("bridge")));
        Self {
            config,
            session,
            handler,
            substrate,
            state: Mutex::new(ClientState::Disconnected),
            reconnect_gate: Mutex::new(()),
            log,
        }
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ClientState) {
        *lock(&self.state) = state;
    }

    fn mark_running(&self) {
        self.session.set_state(SessionState::Running);
        self.set_state(ClientState::Running);
    }

    /// Executes a syscall remotely and blocks for its completion.
    ///
    /// The calling thread doubles as the session's reader whenever that
    /// role is unclaimed, servicing responses for other callers and
    /// inbound reverse callbacks until its own response arrives. On a
    /// lost connection the call is re-sent transparently when the retry
    /// policy allows, and fails with [`ClientError::NotConnected`] once
    /// the policy's time budget is exhausted.
    pub fn execute_syscall(&self, number: u32, args: &[u8]) -> Result<SyscallReply, ClientError> {
        if self.state() == ClientState::Closed {
            return Err(ClientError::NotConnected);
        }
        let mut retry_started: Option<Instant> = None;
        loop {
            match self.call_once(MessageKind::Syscall, HeaderArg::Syscall(number), args) {
                Ok(body) => return Ok(SyscallReply::decode(&body)?),
                Err(SessionError::Remote(code)) => return Err(ClientError::Remote(code)),
                Err(SessionError::Protocol(error)) => return Err(ClientError::Protocol(error)),
                Err(
                    SessionError::NotConnected | SessionError::Closed | SessionError::Io(_),
                ) => {
                    if !matches!(self.config.retry, RetryPolicy::Auto { .. }) {
                        return Err(ClientError::NotConnected);
                    }
                    let started = *retry_started.get_or_insert_with(Instant::now);
                    self.reconnect(started)?;
                }
            }
        }
    }

    /// Asks the server to fork its execution context ahead of the
    /// caller's own OS-level fork. The returned token is presented by
    /// the child via [`RelayClient::fork_complete`].
    pub fn prefork_begin(&self) -> Result<PreforkToken, ClientError> {
        let body = self.call_once(MessageKind::Prefork, HeaderArg::None, &[])?;
        Ok(PreforkToken::from_slice(&body)?)
    }

    /// Called in the forked child: opens a brand-new connection and
    /// claims the pre-forked context, independent of the parent's
    /// session.
    pub fn fork_complete(&self, token: PreforkToken) -> Result<(), ClientError> {
        let stream = self.dial()?;
        self.session.replace_stream(stream).map_err(ClientError::from)?;
        self.fork_complete_inner(token)
    }

    /// Connects a fresh endpoint directly via a fork handshake, for a
    /// child process constructing its client from scratch.
    pub fn connect_forked(
        config: ClientConfig,
        bridge: Arc<dyn MemoryBridge>,
        substrate: Arc<dyn WaitSubstrate>,
        log: Logger,
        token: PreforkToken,
    ) -> Result<Self, ClientError> {
        let client = Self::detached(config, bridge, substrate, log);
        client.set_state(ClientState::Connecting);
        let stream = client.dial()?;
        client.session.attach(stream).map_err(ClientError::from)?;
        client.fork_complete_inner(token)?;
        Ok(client)
    }

    fn fork_complete_inner(&self, token: PreforkToken) -> Result<(), ClientError> {
        self.set_state(ClientState::Handshaking);
        let body = ForkBody {
            token,
            cancel: false,
        }
        .encode();
        let code = self.handshake(HandshakeKind::Fork, &body)?;
        if code != HANDSHAKE_OK {
            self.session.close();
            self.set_state(ClientState::Disconnected);
            return Err(ClientError::HandshakeRefused(code));
        }
        self.mark_running();
        Ok(())
    }

    /// Called when the OS-level fork failed after a successful
    /// [`RelayClient::prefork_begin`]: retires the server-side record so
    /// the pre-forked context is not stranded.
    pub fn fork_cancel(&self, token: PreforkToken) -> Result<(), ClientError> {
        let stream = self.dial()?;
        let scratch = Session::with_stream(
            stream,
            Arc::clone(&self.substrate),
            Some(self.config.max_frame_body),
            self.log.scoped("fork-cancel"),
        )
        .map_err(ClientError::from)?;
        let body = ForkBody {
            token,
            cancel: true,
        }
        .encode();
        let wait = scratch.begin_request();
        let header = Header::request(
            wait.request_no(),
            MessageKind::Handshake,
            HeaderArg::Handshake(HandshakeKind::Fork),
            body.len(),
        );
        scratch
            .send_frame(&header, &body)
            .map_err(ClientError::from)?;
        let reply = scratch.await_reply(&wait, &self.handler).map_err(ClientError::from)?;
        scratch.close();
        let code = decode_result_code(&reply)?;
        if code != HANDSHAKE_OK {
            return Err(ClientError::HandshakeRefused(code));
        }
        Ok(())
    }

    /// Packages the live session's transport identity for an exec'ing
    /// hosting runtime. The runtime must keep the descriptor open across
    /// `exec`; the new image resumes with [`RelayClient::resume_exec`].
    #[cfg(unix)]
    pub fn prepare_exec(&self) -> Result<String, ClientError> {
        let (descriptor, kind) = self
            .session
            .transport_identity()
            .ok_or(ClientError::NotConnected)?;
        let env = ExecEnv {
            address: self.config.address.to_string(),
            descriptor,
            kind: match kind {
                transport::StreamKind::Tcp => "tcp".to_string(),
                transport::StreamKind::Unix => "unix".to_string(),
            },
        };
        env.to_json()
            .map_err(|error| ClientError::Unsupported(format!("encoding exec env: {error}")))
    }

    /// Rebuilds an endpoint in a post-exec process image around the
    /// inherited descriptor, resuming the logical session with an
    /// exec-continuation handshake instead of a fresh guest handshake.
    ///
    /// # Safety
    ///
    /// The descriptor recorded in `env` must be open in this process and
    /// not owned by anything else.
    #[cfg(unix)]
    pub unsafe fn resume_exec(
        env: &str,
        config: ClientConfig,
        bridge: Arc<dyn MemoryBridge>,
        substrate: Arc<dyn WaitSubstrate>,
        log: Logger,
    ) -> Result<Self, ClientError> {
        let env = ExecEnv::from_json(env)
            .map_err(|error| ClientError::Unsupported(format!("decoding exec env: {error}")))?;
        let kind = match env.kind.as_str() {
            "tcp" => transport::StreamKind::Tcp,
            "unix" => transport::StreamKind::Unix,
            other => {
                return Err(ClientError::Unsupported(format!(
                    "unknown transport kind {other:?} in exec env"
                )))
            }
        };
        let stream = RelayStream::from_raw_descriptor(env.descriptor, kind);
        let client = Self::detached(config, bridge, substrate, log);
        client.session.attach(stream).map_err(ClientError::from)?;
        client.set_state(ClientState::Handshaking);
        let code = client.handshake(HandshakeKind::ExecContinuation, &[])?;
        if code != HANDSHAKE_OK {
            client.session.close();
            return Err(ClientError::HandshakeRefused(code));
        }
        client.mark_running();
        Ok(client)
    }

    /// Closes the session; subsequent calls fail with `NotConnected`.
    pub fn close(&self) {
        self.set_state(ClientState::Closed);
        self.session.close();
    }

    /// Opens the socket, applies the transport connect hook, and reads
    /// and validates the server banner.
    fn dial(&self) -> Result<RelayStream, ClientError> {
        let mut stream = RelayStream::connect(&self.config.address)?;
        let banner = read_banner_line(&mut stream)?;
        parse_banner(&banner)?;
        Ok(stream)
    }

    fn guest_handshake(&self) -> Result<(), ClientError> {
        let program = self.config.program.clone().into_bytes();
        let code = self.handshake(HandshakeKind::Guest, &program)?;
        if code != HANDSHAKE_OK {
            return Err(ClientError::HandshakeRefused(code));
        }
        Ok(())
    }

    fn handshake(&self, kind: HandshakeKind, body: &[u8]) -> Result<u32, ClientError> {
        let reply = self.call_once(MessageKind::Handshake, HeaderArg::Handshake(kind), body)?;
        Ok(decode_result_code(&reply)?)
    }

    /// One request/response exchange on the current connection, with no
    /// retry.
    fn call_once(
        &self,
        kind: MessageKind,
        arg: HeaderArg,
        body: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let wait = self.session.begin_request();
        let header = Header::request(wait.request_no(), kind, arg, body.len());
        if let Err(error) = self.session.send_frame(&header, body) {
            self.session.forget_wait(wait.request_no());
            return Err(error);
        }
        self.session.await_reply(&wait, &self.handler)
    }

    /// Rebuilds the connection under the retry policy. Serialized: one
    /// thread dials while the others park on the gate; whoever enters
    /// after a successful rebuild returns immediately.
    fn reconnect(&self, started: Instant) -> Result<(), ClientError> {
        let _gate = lock(&self.reconnect_gate);
        if self.session.is_connected() {
            return Ok(());
        }
        let RetryPolicy::Auto {
            give_up_after,
            initial_backoff,
            max_backoff,
        } = self.config.retry
        else {
            return Err(ClientError::NotConnected);
        };

        self.set_state(ClientState::Reconnecting);
        let mut backoff = initial_backoff;
        let mut first_failure_logged = false;
        let mut last_progress = Instant::now();

        loop {
            match self.try_rebuild() {
                Ok(()) => {
                    self.log.info(format!(
                        "reconnected to {} after {:?}",
                        self.config.address,
                        started.elapsed()
                    ));
                    return Ok(());
                }
                Err(error) => {
                    if !first_failure_logged {
                        self.log.warn(format!(
                            "connection to {} lost, retrying: {error}",
                            self.config.address
                        ));
                        first_failure_logged = true;
                        last_progress = Instant::now();
                    } else if last_progress.elapsed() >= RECONNECT_PROGRESS_INTERVAL {
                        self.log.info(format!(
                            "still reconnecting to {} ({:?} elapsed)",
                            self.config.address,
                            started.elapsed()
                        ));
                        last_progress = Instant::now();
                    }
                    if started.elapsed() >= give_up_after {
                        self.set_state(ClientState::Disconnected);
                        return Err(ClientError::NotConnected);
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    fn try_rebuild(&self) -> Result<(), ClientError> {
        let stream = self.dial()?;
        self.session.replace_stream(stream).map_err(ClientError::from)?;
        self.set_state(ClientState::Handshaking);
        self.guest_handshake()?;
        self.mark_running();
        Ok(())
    }
}

/// Reads the newline-terminated banner, one byte at a time so no frame
/// bytes following it are swallowed.
fn read_banner_line(stream: &mut RelayStream) -> Result<String, ClientError> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).map_err(TransportError::from)?;
        if n == 0 {
            return Err(ClientError::Protocol(WireError::BadBanner(
                "connection closed before banner".to_string(),
            )));
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_BANNER_LEN {
            return Err(ClientError::Protocol(WireError::BadBanner(format!(
                "no newline within {MAX_BANNER_LEN} bytes"
            ))));
        }
    }
    String::from_utf8(line).map_err(|_| {
        ClientError::Protocol(WireError::BadBanner("banner is not valid UTF-8".to_string()))
    })
}
