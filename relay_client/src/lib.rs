//! # Relay Client
//!
//! The client endpoint of the relay runtime: connect to a relay server,
//! execute syscalls in the remote execution context, survive connection
//! loss transparently, and carry the session across the hosting
//! runtime's fork and exec boundaries.
//!
//! ## Philosophy
//!
//! - **The caller is the reader**: no background thread owns the socket;
//!   whichever thread waits for a response pumps the stream, which keeps
//!   a freshly forked child free of orphaned parent threads
//! - **Retry is policy, not accident**: reconnection happens only under
//!   an explicit [`RetryPolicy`], within its time budget, and is logged
//!   with restraint
//! - **The address space is a seam**: reverse callbacks run against the
//!   [`MemoryBridge`] trait; the runtime decides what "client memory"
//!   means

mod bridge;
mod config;
mod endpoint;
mod exec;

pub use bridge::{BridgeFault, BridgeHandler, MemoryBridge};
pub use config::{ClientConfig, RetryPolicy};
pub use endpoint::{ClientError, ClientState, RelayClient};
pub use exec::ExecEnv;
