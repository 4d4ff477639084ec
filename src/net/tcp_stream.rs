//! Indirection over `mio::net::TcpStream` so connection-level code (and its
//! tests) aren't hard-wired to a real kernel socket.
//!
//! Grounded on the teacher's identical `TcpStream` trait in
//! `src/net/tcp_stream.rs`, which already provides a `mio::net::TcpStream`
//! impl; a `MockStream` impl is added here so
//! [`crate::net::connection::TcpConnection`] and [`crate::net::tcp_client::TcpClient`]
//! can be unit-tested without binding real sockets.

use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

/// The subset of socket operations connection-level code needs, independent
/// of whether the concrete stream is `mio`'s non-blocking socket or a test
/// double.
pub trait TcpStream {
    /// Opens a non-blocking connection to `addr`. Returns immediately;
    /// completion is observed via writable readiness, per spec §4.5.
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// The remote address, once connected.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// The local address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Shuts down one or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Sets `TCP_NODELAY`.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// Reads back the current `TCP_NODELAY` setting.
    fn nodelay(&self) -> Result<bool>;

    /// Sets the IP TTL.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Reads back the current IP TTL.
    fn ttl(&self) -> Result<u32>;

    /// Retrieves and clears `SO_ERROR`. Used after a non-blocking connect
    /// becomes writable, to distinguish "connected" from "connect failed".
    fn take_error(&self) -> Result<Option<Error>>;

    /// Peeks at incoming bytes without consuming them (used to sniff an H2
    /// client preface before committing to an HTTP/1.1 parse).
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
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

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}

/// An in-memory stand-in for a socket, used by connection/client/server unit
/// tests so they can drive `read`/`write`/readiness behavior without a real
/// fd. Reads pull from `inbound`; writes push onto `outbound`.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockStream {
    /// Bytes waiting to be "received" by the next `read` call.
    pub inbound: std::collections::VecDeque<u8>,
    /// Bytes accumulated by `write` calls, in order.
    pub outbound: Vec<u8>,
    /// When true, `read` returns `WouldBlock` instead of `Ok(0)` once
    /// `inbound` is drained, simulating an open-but-idle socket.
    pub would_block_on_empty_read: bool,
}

#[cfg(test)]
impl MockStream {
    /// Creates a mock with `bytes` queued for the next reads.
    pub fn with_inbound(bytes: &[u8]) -> Self {
        Self {
            inbound: bytes.iter().copied().collect(),
            outbound: Vec::new(),
            would_block_on_empty_read: true,
        }
    }
}

#[cfg(test)]
impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inbound.is_empty() {
            if self.would_block_on_empty_read {
                return Err(Error::from(std::io::ErrorKind::WouldBlock));
            }
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl TcpStream for MockStream {
    fn connect(_addr: SocketAddr) -> Result<Self> {
        Ok(Self::default())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:0".parse().unwrap())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:0".parse().unwrap())
    }

    fn shutdown(&self, _how: Shutdown) -> Result<()> {
        Ok(())
    }

    fn set_nodelay(&self, _nodelay: bool) -> Result<()> {
        Ok(())
    }

    fn nodelay(&self) -> Result<bool> {
        Ok(true)
    }

    fn set_ttl(&self, _ttl: u32) -> Result<()> {
        Ok(())
    }

    fn ttl(&self) -> Result<u32> {
        Ok(64)
    }

    fn take_error(&self) -> Result<Option<Error>> {
        Ok(None)
    }

    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        for (i, b) in self.inbound.iter().take(buf.len()).enumerate() {
            buf[i] = *b;
        }
        Ok(buf.len().min(self.inbound.len()))
    }
}
