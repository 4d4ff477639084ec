//! Indirection over `mio::net::TcpListener`, mirroring [`super::tcp_stream::TcpStream`].
//!
//! Grounded on the teacher's identical `TcpListener` trait; kept as a trait
//! rather than using `mio::net::TcpListener` directly so
//! [`crate::net::tcp_server::TcpServer`] stays testable.

use std::io::{Error, Result};
use std::net::SocketAddr;

use super::tcp_stream::TcpStream;

/// The subset of listening-socket operations [`crate::net::tcp_server::TcpServer`]
/// needs.
pub trait TcpListener<S: TcpStream> {
    /// Binds a listening socket to `addr` with `SO_REUSEADDR` set.
    fn bind(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// Accepts one pending connection, or `WouldBlock` if none are queued.
    fn accept(&self) -> Result<(S, SocketAddr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Sets the IP TTL new connections inherit.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Reads back the current IP TTL.
    fn ttl(&self) -> Result<u32>;

    /// Retrieves and clears `SO_ERROR`.
    fn take_error(&self) -> Result<Option<Error>>;
}

type MTcpListener = mio::net::TcpListener;
type MTcpStream = mio::net::TcpStream;

impl TcpListener<MTcpStream> for MTcpListener {
    #[inline]
    fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind(addr)
    }

    #[inline]
    fn accept(&self) -> Result<(MTcpStream, SocketAddr)> {
        Self::accept(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }
}
