//! The hosting-runtime seam.
//!
//! The relay server does not execute syscalls itself; it routes them
//! into the hosting runtime through [`KernelHost`]. Multiple
//! implementations are possible: an in-process kernel, a test double, a
//! shim over a real dispatcher. The server only ever holds a
//! `dyn KernelHost`.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;
use wire::SyscallReply;

use crate::callback::RemoteMemory;

/// Unique identifier for a server-side execution context
///
/// A session is bound to exactly one execution context; syscalls arriving
/// on that session run against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Creates a new random context ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.0)
    }
}

/// Errors from the hosting runtime's context management.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to create execution context: {0}")]
    SpawnFailed(String),

    #[error("failed to fork execution context: {0}")]
    ForkFailed(String),
}

/// The interface the hosting runtime implements for the server.
///
/// `syscall` receives a [`RemoteMemory`] bound to the calling session;
/// through it the dispatcher reads and writes the remote caller's
/// address space and delivers signals, nested inside the syscall.
pub trait KernelHost: Send + Sync {
    /// Creates a fresh execution context for a guest handshake.
    fn spawn_guest(&self, program: &str) -> Result<ContextId, HostError>;

    /// Forks an execution context ahead of a client fork.
    fn fork_context(&self, context: ContextId) -> Result<ContextId, HostError>;

    /// Observes an exec on the context, after its in-flight syscalls
    /// drained.
    fn exec_notify(&self, context: ContextId);

    /// Releases a context whose session is gone or whose pre-fork record
    /// was discarded.
    fn release(&self, context: ContextId);

    /// Executes one syscall against the context.
    fn syscall(
        &self,
        context: ContextId,
        number: u32,
        args: &[u8],
        memory: &dyn RemoteMemory,
    ) -> SyscallReply;
}
