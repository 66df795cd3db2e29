//! # Transport
//!
//! Byte-stream transports for SysRelay sessions: endpoint addressing,
//! connect/accept wrappers, and per-transport socket hooks.
//!
//! ## Philosophy
//!
//! - **Schemes are explicit**: an endpoint is `tcp://host:port` or
//!   `unix:///path`; an unsupported scheme fails at parse time, not at
//!   first use
//! - **One seam for socket quirks**: transport-specific setup (disabling
//!   Nagle on TCP) lives here, invisible to the session layer
//! - **Split halves**: a stream clones into independent send and receive
//!   handles so one side can be torn down to unblock the other

mod addr;
mod listener;
mod stream;

pub use addr::{Endpoint, TransportError};
pub use listener::RelayListener;
pub use stream::RelayStream;
#[cfg(unix)]
pub use stream::StreamKind;
