//! Listening sockets.

use std::io;
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::PathBuf;

use crate::addr::{Endpoint, TransportError};
use crate::stream::{apply_tcp_hook, RelayStream};

/// A bound listening socket for one of the supported transports.
#[derive(Debug)]
pub enum RelayListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl RelayListener {
    /// Binds a listener on the endpoint. For unix sockets a stale socket
    /// file from a previous run is removed first.
    pub fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str())?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(path);
                Ok(Self::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::UnsupportedScheme(endpoint.to_string())),
        }
    }

    /// Accepts one connection and applies the transport's accept hook.
    pub fn accept(&self) -> io::Result<RelayStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                apply_tcp_hook(&stream)?;
                Ok(RelayStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                Ok(RelayStream::Unix(stream))
            }
        }
    }

    /// The endpoint actually bound. For TCP this resolves a requested
    /// port 0 to the assigned port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_tcp_bind_accept_connect() {
        let listener = RelayListener::bind(&Endpoint::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let join = std::thread::spawn(move || {
            let mut client = RelayStream::connect(&endpoint).unwrap();
            client.write_all(b"ping").unwrap();
        });

        let mut accepted = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        join.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_bind_accept_connect() {
        let path = std::env::temp_dir().join(format!("relay-listener-{}.sock", std::process::id()));
        let endpoint = Endpoint::Unix(path.clone());
        let listener = RelayListener::bind(&endpoint).unwrap();

        let join = std::thread::spawn(move || {
            let mut client = RelayStream::connect(&endpoint).unwrap();
            client.write_all(b"pong").unwrap();
        });

        let mut accepted = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        join.join().unwrap();

        drop(listener);
        assert!(!path.exists());
    }
}
