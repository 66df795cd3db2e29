//! Server configuration.

use std::time::Duration;

use transport::Endpoint;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard ceiling on concurrent workers; at the ceiling with none idle
    /// a syscall request is answered with try-again.
    pub max_workers: usize,
    /// Idle workers are kept down to this count; the rest self-terminate
    /// after `idle_timeout`.
    pub reserve_workers: usize,
    /// How long an idle worker above the reserve lingers before exiting.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 32,
            reserve_workers: 2,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a relay server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `tcp://0.0.0.0:4096` or `unix:///run/relay.sock`.
    pub listen: Endpoint,
    /// Ceiling on concurrently connected sessions; connections beyond it
    /// are dropped at accept.
    pub max_sessions: usize,
    /// Largest frame body accepted from a client; larger requests are
    /// answered with out-of-memory.
    pub max_frame_body: usize,
    pub pool: PoolConfig,
    /// Optional bound on outstanding pre-fork records. `None` keeps
    /// records until consumed; a bound discards the oldest record (and
    /// releases its forked context) when exceeded.
    pub prefork_capacity: Option<usize>,
}

impl ServerConfig {
    pub fn new(listen: Endpoint) -> Self {
        Self {
            listen,
            max_sessions: 64,
            max_frame_body: 16 * 1024 * 1024,
            pool: PoolConfig::default(),
            prefork_capacity: None,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_max_frame_body(mut self, limit: usize) -> Self {
        self.max_frame_body = limit;
        self
    }

    pub fn with_prefork_capacity(mut self, capacity: usize) -> Self {
        self.prefork_capacity = Some(capacity);
        self
    }
}
