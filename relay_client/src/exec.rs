//! Exec-continuation environment value.
//!
//! Before the hosting runtime replaces the process image, it asks the
//! client to package the session's transport identity. The value is a
//! JSON string the new image feeds back to [`crate::RelayClient::resume_exec`],
//! which rebuilds the endpoint around the inherited descriptor and runs
//! the exec-continuation handshake instead of a fresh guest handshake.
//!
//! Keeping the descriptor open across `exec` (clearing close-on-exec) is
//! the hosting runtime's job, alongside the `exec` call itself.

use serde::{Deserialize, Serialize};

/// Serialized transport identity of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnv {
    /// Server address the session was connected to, for diagnostics and
    /// connection-oriented local transports.
    pub address: String,
    /// Inherited socket descriptor number.
    pub descriptor: i32,
    /// Transport the descriptor belongs to: `"tcp"` or `"unix"`.
    pub kind: String,
}

impl ExecEnv {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
