//! The server endpoint: accept loop and session lifecycle.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relay_log::Logger;
use session::{default_substrate, InboundHandler, Session, WaitSubstrate};
use thiserror::Error;
use transport::{Endpoint, RelayListener, RelayStream, TransportError};
use wire::format_banner;

use crate::config::ServerConfig;
use crate::dispatch::ServerHandler;
use crate::host::KernelHost;
use crate::pool::WorkerPool;
use crate::prefork::PreforkTable;
use crate::registry::{ServerSession, SessionRegistry};

/// Errors surfaced by the server endpoint.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("accept failed: {0}")]
    Accept(String),
}

/// A relay server: listens on one endpoint, demultiplexes each accepted
/// session on a dedicated reader, and runs syscalls on a bounded worker
/// pool against the hosting runtime.
pub struct RelayServer {
    config: ServerConfig,
    listener: RelayListener,
    registry: Arc<SessionRegistry>,
    pool: Arc<WorkerPool>,
    handler: Arc<ServerHandler>,
    host: Arc<dyn KernelHost>,
    substrate: Arc<dyn WaitSubstrate>,
    log: Logger,
    stopping: AtomicBool,
}

impl RelayServer {
    /// Binds the listen endpoint. Unsupported schemes fail here, before
    /// any session exists.
    pub fn bind(config: ServerConfig, host: Arc<dyn KernelHost>) -> Result<Self, ServerError> {
        Self::bind_with(config, host, default_substrate(), Logger::stderr("relay-server"))
    }

    /// As [`RelayServer::bind`] with an explicit blocking substrate and
    /// logger.
    pub fn bind_with(
        config: ServerConfig,
        host: Arc<dyn KernelHost>,
        substrate: Arc<dyn WaitSubstrate>,
        log: Logger,
    ) -> Result<Self, ServerError> {
        let listener = RelayListener::bind(&config.listen)?;
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let preforks = Arc::new(PreforkTable::new(config.prefork_capacity));
        let pool = WorkerPool::new(config.pool, log.scoped("pool"));
        let handler = ServerHandler::new(
            Arc::clone(&registry),
            preforks,
            Arc::clone(&pool),
            Arc::clone(&host),
            log.scoped("dispatch"),
        );
        Ok(Self {
            config,
            listener,
            registry,
            pool,
            handler,
            host,
            substrate,
            log,
            stopping: AtomicBool::new(false),
        })
    }

    /// The endpoint actually bound; resolves a requested TCP port 0.
    pub fn local_endpoint(&self) -> Result<Endpoint, ServerError> {
        Ok(self.listener.local_endpoint().map_err(TransportError::from)?)
    }

    /// Accepts connections until [`RelayServer::stop`] is called. On
    /// return every session has been torn down and the worker pool
    /// stopped.
    pub fn run(&self) -> Result<(), ServerError> {
        self.log
            .info(format!("listening on {}", self.config.listen));
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let stream = match self.listener.accept() {
                Ok(stream) => stream,
                Err(error) => {
                    if self.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    return Err(ServerError::Accept(error.to_string()));
                }
            };
            if self.stopping.load(Ordering::Acquire) {
                // The wakeup connection from stop().
                break;
            }
            self.admit(stream);
        }

        self.pool.shutdown();
        for entry in self.registry.drain() {
            entry.session().close();
            if let Some(context) = entry.take_context() {
                self.host.release(context);
            }
        }
        self.log.info("server stopped");
        Ok(())
    }

    /// Asks the accept loop to exit. Safe from any thread.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        // Unblock the accept call with a throwaway connection.
        if let Ok(endpoint) = self.local_endpoint() {
            if let Ok(stream) = RelayStream::connect(&endpoint) {
                stream.shutdown();
            }
        }
    }

    /// Connected session count, for tests and introspection.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn admit(&self, mut stream: RelayStream) {
        if self.registry.at_capacity() {
            // Rejected before the banner: a peer over capacity gets no
            // protocol surface at all.
            self.log.warn(format!(
                "session table full ({}), dropping {}",
                self.config.max_sessions,
                stream.peer_label()
            ));
            stream.shutdown();
            return;
        }
        if stream.write_all(format_banner().as_bytes()).is_err() {
            return;
        }

        let peer = stream.peer_label();
        let session = match Session::with_stream(
            stream,
            Arc::clone(&self.substrate),
            Some(self.config.max_frame_body),
            self.log.scoped(&peer),
        ) {
            Ok(session) => session,
            Err(error) => {
                self.log.warn(format!("could not set up session for {peer}: {error}"));
                return;
            }
        };
        let entry = ServerSession::new(Arc::clone(&session), self.substrate.as_ref());
        if self.registry.insert(Arc::clone(&entry)).is_err() {
            session.close();
            return;
        }
        self.log.info(format!("accepted {peer} as {}", session.id()));

        let handler: Arc<dyn InboundHandler> = self.handler.clone();
        let registry = Arc::clone(&self.registry);
        let host = Arc::clone(&self.host);
        let log = self.log.clone();
        let reader = {
            let session = Arc::clone(&session);
            let entry = Arc::clone(&entry);
            std::thread::Builder::new()
                .name("relay-session".to_string())
                .spawn(move || {
                    let cause = session.run_reader(&handler);
                    registry.remove(session.id());
                    if let Some(context) = entry.take_context() {
                        host.release(context);
                    }
                    log.info(format!("session {} closed: {cause}", session.id()));
                })
        };
        if reader.is_err() {
            self.registry.remove(session.id());
            session.close();
            self.log.warn(format!("could not start reader for {peer}"));
        }
    }
}
