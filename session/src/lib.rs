//! # Session
//!
//! Per-connection state for the relay runtime: request correlation,
//! the single-writer/single-reader stream disciplines, generation-based
//! invalidation across reconnects, and the abstract blocking-wait
//! substrate the whole runtime parks on.
//!
//! ## Philosophy
//!
//! - **One writer, one reader**: a session's stream never carries torn
//!   frames and never has two competing readers; the disciplines are
//!   enforced with ordinary lock semantics, not bespoke state machines
//! - **Correlation is exact**: a response resolves the one wait with the
//!   same request number in the same generation, or it is discarded
//! - **Teardown, not repair**: a desynchronized or dead session fails
//!   every waiter and is rebuilt from scratch
//! - **Substrate-agnostic blocking**: callers park on [`Signal`]s; OS
//!   threads and cooperative scheduling are interchangeable backends

mod park;
mod session;
mod wait;

pub use park::{default_substrate, Signal, ThreadSubstrate, WaitSubstrate, YieldSubstrate};
pub use session::{InboundHandler, Session, SessionError, SessionId, SessionState};
pub use wait::{PendingWait, WaitOutcome, WaitTable};
