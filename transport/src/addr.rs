//! Endpoint addressing.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address names a scheme this build does not support.
    #[error("unsupported scheme in address {0:?}")]
    UnsupportedScheme(String),

    /// The address part after the scheme is not valid for that scheme.
    #[error("malformed address: {0}")]
    BadAddress(String),

    /// Underlying socket failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport endpoint: where a server listens and a client connects.
///
/// Parsed from `<scheme>://<address>`; `tcp` addresses are `host:port`,
/// `unix` addresses are filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parses a `<scheme>://<address>` string.
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| TransportError::BadAddress(format!("{address:?} has no scheme")))?;
        match scheme {
            "tcp" => {
                if rest.is_empty() || !rest.contains(':') {
                    return Err(TransportError::BadAddress(format!(
                        "tcp address {rest:?} must be host:port"
                    )));
                }
                Ok(Self::Tcp(rest.to_string()))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(TransportError::BadAddress(
                        "unix address must be a path".to_string(),
                    ));
                }
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            _ => Err(TransportError::UnsupportedScheme(address.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:4096").unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:4096".to_string()));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:4096");
    }

    #[test]
    fn test_parse_unix() {
        let endpoint = Endpoint::parse("unix:///run/relay.sock").unwrap();
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/run/relay.sock")));
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(matches!(
            Endpoint::parse("sctp://host:1"),
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_missing_scheme_rejected() {
        assert!(matches!(
            Endpoint::parse("127.0.0.1:4096"),
            Err(TransportError::BadAddress(_))
        ));
    }

    #[test]
    fn test_tcp_without_port_rejected() {
        assert!(matches!(
            Endpoint::parse("tcp://localhost"),
            Err(TransportError::BadAddress(_))
        ));
    }

    #[test]
    fn test_round_trips_through_display() {
        for text in ["tcp://[::1]:9000", "unix:///tmp/s.sock"] {
            let endpoint = Endpoint::parse(text).unwrap();
            assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }
}
