//! # Relay Server
//!
//! The server endpoint of the relay runtime: accept sessions, bind each
//! to an execution context in the hosting runtime, demultiplex
//! concurrent requests, run syscalls on a bounded worker pool, and issue
//! reverse callbacks into the remote caller's address space while a
//! syscall is in flight.
//!
//! ## Philosophy
//!
//! - **The kernel is a seam**: syscall execution and context lifecycle
//!   live behind [`KernelHost`]; the server is pure plumbing
//! - **One bad client costs one session**: protocol violations tear down
//!   the offending session, nothing else
//! - **Overload answers, never drops**: a saturated pool says try-again,
//!   an oversized request says out-of-memory, a full table refuses at
//!   accept

mod callback;
mod config;
mod dispatch;
mod host;
mod pool;
mod prefork;
mod registry;
mod server;

pub use callback::{CallbackError, RemoteMemory, SessionMemory};
pub use config::{PoolConfig, ServerConfig};
pub use dispatch::ServerHandler;
pub use host::{ContextId, HostError, KernelHost};
pub use pool::{PoolError, WorkerPool};
pub use prefork::PreforkTable;
pub use registry::{RegistryError, ServerSession, SessionRegistry};
pub use server::{RelayServer, ServerError};
