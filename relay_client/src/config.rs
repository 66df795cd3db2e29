//! Client configuration.

use std::time::Duration;

use transport::Endpoint;

/// Automatic-reconnection policy for [`crate::RelayClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// A lost connection fails the in-flight call immediately.
    Never,
    /// A lost connection is rebuilt transparently; the in-flight call is
    /// re-sent on the new connection. Reconnection attempts back off
    /// exponentially and give up once the total elapsed time since the
    /// call first failed exceeds `give_up_after`.
    Auto {
        give_up_after: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl RetryPolicy {
    /// Automatic reconnection with the default backoff curve.
    pub fn auto(give_up_after: Duration) -> Self {
        Self::Auto {
            give_up_after,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Never
    }
}

/// Configuration for a client endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `tcp://127.0.0.1:4096`.
    pub address: Endpoint,
    /// Program name presented in the guest handshake.
    pub program: String,
    pub retry: RetryPolicy,
    /// Largest frame body accepted from the server.
    pub max_frame_body: usize,
}

impl ClientConfig {
    pub fn new(address: Endpoint, program: impl Into<String>) -> Self {
        Self {
            address,
            program: program.into(),
            retry: RetryPolicy::Never,
            max_frame_body: 16 * 1024 * 1024,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_frame_body(mut self, limit: usize) -> Self {
        self.max_frame_body = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_never() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::Never);
    }

    #[test]
    fn test_auto_backoff_defaults() {
        let policy = RetryPolicy::auto(Duration::from_secs(60));
        match policy {
            RetryPolicy::Auto {
                give_up_after,
                initial_backoff,
                max_backoff,
            } => {
                assert_eq!(give_up_after, Duration::from_secs(60));
                assert!(initial_backoff < max_backoff);
            }
            RetryPolicy::Never => panic!("expected auto policy"),
        }
    }
}
