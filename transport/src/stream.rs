//! Connected byte streams.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::addr::{Endpoint, TransportError};

/// A connected stream over one of the supported transports.
///
/// Cloning (via [`RelayStream::try_clone`]) yields an independent handle
/// to the same socket, which is how a session splits its send and receive
/// halves.
#[derive(Debug)]
pub enum RelayStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl RelayStream {
    /// Connects to an endpoint and applies the transport's connect hook.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                apply_tcp_hook(&stream)?;
                Ok(Self::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::UnsupportedScheme(endpoint.to_string())),
        }
    }

    /// Clones the underlying socket into an independent handle.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }

    /// Shuts down both directions, unblocking any thread parked in a
    /// read on another handle to the same socket. Errors are ignored:
    /// the socket may already be gone.
    pub fn shutdown(&self) {
        let _ = match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }

    /// Human-readable peer description for log entries.
    pub fn peer_label(&self) -> String {
        match self {
            Self::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            Self::Unix(_) => "unix".to_string(),
        }
    }
}

/// Connect/accept hook for TCP: request frames are small and latency
/// bound, so Nagle coalescing is disabled.
pub(crate) fn apply_tcp_hook(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

impl Read for RelayStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for RelayStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

#[cfg(unix)]
mod raw {
    //! Raw-descriptor passage for the exec-continuation surface. The
    //! hosting runtime is responsible for keeping the descriptor open
    //! across `exec`; these helpers only translate between a stream and
    //! its descriptor number.

    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    use super::RelayStream;

    /// Which transport a raw descriptor belongs to; recorded alongside
    /// the descriptor so the post-exec image rebuilds the right wrapper.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StreamKind {
        Tcp,
        Unix,
    }

    impl RelayStream {
        pub fn stream_kind(&self) -> StreamKind {
            match self {
                Self::Tcp(_) => StreamKind::Tcp,
                Self::Unix(_) => StreamKind::Unix,
            }
        }

        pub fn as_raw_descriptor(&self) -> RawFd {
            match self {
                Self::Tcp(stream) => stream.as_raw_fd(),
                Self::Unix(stream) => stream.as_raw_fd(),
            }
        }

        /// Rebuilds a stream around an inherited descriptor.
        ///
        /// # Safety
        ///
        /// `fd` must be an open descriptor of the stated kind, owned by
        /// the caller from this point on.
        pub unsafe fn from_raw_descriptor(fd: RawFd, kind: StreamKind) -> Self {
            match kind {
                StreamKind::Tcp => Self::Tcp(std::net::TcpStream::from_raw_fd(fd)),
                StreamKind::Unix => Self::Unix(std::os::unix::net::UnixStream::from_raw_fd(fd)),
            }
        }
    }
}

#[cfg(unix)]
pub use raw::StreamKind;
