//! The DNS resolver seam: `lookup(host, port, socktype) -> [AddressInfo] |
//! Error`, run off the reactor thread and handed back through its mailbox.
//!
//! Grounded on the teacher's `worker.rs`/`listener.rs` split: workers do
//! blocking work on their own threads and report back to the single-threaded
//! owner through a channel plus a [`mio::Waker`] nudge, rather than the
//! owner ever blocking itself. `ThreadResolver` applies the same shape to
//! `std::net::ToSocketAddrs` instead of a worker pool pulling connections off
//! a `crossbeam_channel`, since a lookup is a one-shot unit of work rather
//! than a queue of recurring events.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;

use crate::reactor::Reactor;

/// The socket type a lookup is performed for, passed through unchanged to
/// [`AddressInfo::socktype`]. UDP is out of scope for the core itself (see
/// the crate's non-goals) but the interface still carries it, since an
/// application gluing this resolver to its own UDP code should not need a
/// second lookup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    /// A connection-oriented stream socket (`SOCK_STREAM`).
    Stream,
    /// A connectionless datagram socket (`SOCK_DGRAM`).
    Dgram,
}

/// One resolved address record, mirroring a single `getaddrinfo` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    /// The socket type the lookup was performed for.
    pub socktype: SockType,
    /// Protocol number (`IPPROTO_TCP`/`IPPROTO_UDP`), derived from `socktype`
    /// since `std::net` never surfaces one explicitly.
    pub protocol: i32,
    /// The resolved address and port, ready to hand to
    /// [`crate::net::tcp_client::TcpClient::connect`].
    pub sockaddr: SocketAddr,
}

const IPPROTO_TCP: i32 = 6;
const IPPROTO_UDP: i32 = 17;

/// A failed lookup. `code`/`message` are an opaque pass-through of whatever
/// the underlying resolution failed with — platform resolver error codes
/// are not standardized, so the core does not attempt to interpret them
/// (see the DNS Open Question decision in `DESIGN.md`).
#[derive(Clone, PartialEq, Eq)]
pub struct DnsError {
    /// Platform-dependent numeric code; `0` when none is available (e.g. an
    /// empty result set, which `std::net` itself treats as success).
    pub code: i32,
    /// Human-readable description, suitable for logging.
    pub message: String,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns lookup failed ({}): {}", self.code, self.message)
    }
}

impl fmt::Debug for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DnsError {{ code: {}, message: {:?} }}", self.code, self.message)
    }
}

impl std::error::Error for DnsError {}

/// Outcome of a [`Resolver::lookup`], delivered to its callback.
pub type LookupResult = Result<Vec<AddressInfo>, DnsError>;

/// An async name resolver: the core's only externally-delegated subsystem
/// that is permitted to block a thread, since it must never block the
/// reactor thread itself.
pub trait Resolver {
    /// Begins resolving `host:port` for `socktype`. `callback` runs exactly
    /// once, back on `reactor`'s own thread, after hopping through its
    /// mailbox — never synchronously from within `lookup` itself, and never
    /// from the thread performing the resolution.
    fn lookup(
        &self,
        reactor: &mut Reactor,
        host: &str,
        port: u16,
        socktype: SockType,
        callback: impl FnOnce(LookupResult) + 'static,
    );
}

/// Wraps a value that is not `Send` so it can ride along inside a closure
/// that must be `Send` to cross a thread boundary. Sound only because the
/// wrapped closure is constructed on the reactor thread and is guaranteed to
/// be invoked — never merely inspected or dropped with side effects — back
/// on that same thread once [`Reactor::mailbox`] delivers it; the worker
/// thread that carries it in transit never touches its contents.
///
/// `pub(crate)`: [`crate::http::client::pool`] reuses the same idiom to post
/// `Rc`-based continuations (DNS-then-connect, retry-after-delay) through
/// the mailbox as a same-thread deferral mechanism — not to cross an actual
/// thread boundary, but to get a genuine `&mut Reactor` back from inside a
/// dispatched callback, which nothing else in this crate's event model
/// hands out.
pub(crate) struct AssertSend<T>(pub(crate) T);

// SAFETY: see struct doc. The value only ever moves through the worker
// thread's stack on its way back to the reactor thread; nothing on the
// worker thread reads, clones, or drops its contents.
unsafe impl<T> Send for AssertSend<T> {}

/// Resolves names on a fresh `std::thread` per lookup, using
/// `std::net::ToSocketAddrs` (which shells out to the platform's
/// `getaddrinfo`). No caching, no shared thread pool: matches the explicit
/// non-goal against DNS caching inside the core, and a lookup is rare enough
/// relative to connection lifetime that a dedicated thread per call is not a
/// meaningful cost next to the network round trip it performs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadResolver;

impl ThreadResolver {
    /// Creates a resolver. Stateless; cheap to construct per `HttpClient` or
    /// share across many.
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for ThreadResolver {
    fn lookup(
        &self,
        reactor: &mut Reactor,
        host: &str,
        port: u16,
        socktype: SockType,
        callback: impl FnOnce(LookupResult) + 'static,
    ) {
        let mailbox = reactor.mailbox();
        let host = host.to_owned();
        let callback = AssertSend(Box::new(callback) as Box<dyn FnOnce(LookupResult)>);

        thread::spawn(move || {
            let result = resolve_blocking(&host, port, socktype);
            mailbox.post(move |_reactor| {
                let callback = callback;
                (callback.0)(result);
            });
        });
    }
}

fn resolve_blocking(host: &str, port: u16, socktype: SockType) -> LookupResult {
    let protocol = match socktype {
        SockType::Stream => IPPROTO_TCP,
        SockType::Dgram => IPPROTO_UDP,
    };
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let records: Vec<AddressInfo> = addrs
                .map(|sockaddr| AddressInfo {
                    socktype,
                    protocol,
                    sockaddr,
                })
                .collect();
            if records.is_empty() {
                log::debug!("dns lookup for {host}:{port} returned no records");
                Err(DnsError {
                    code: 0,
                    message: format!("no address records for {host}"),
                })
            } else {
                Ok(records)
            }
        }
        Err(e) => {
            log::debug!("dns lookup for {host}:{port} failed: {e}");
            Err(DnsError {
                code: e.raw_os_error().unwrap_or(0),
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn resolves_a_numeric_address_and_hops_back_through_the_mailbox() {
        // A numeric address needs no real DNS query, keeping this test fast
        // and offline-safe while still exercising the full thread -> mailbox
        // -> callback path.
        let mut reactor = Reactor::with_precision(Duration::from_millis(10)).unwrap();
        let resolver = ThreadResolver::new();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();

        resolver.lookup(&mut reactor, "127.0.0.1", 80, SockType::Stream, move |result| {
            *s.borrow_mut() = Some(result);
        });

        // The callback is never invoked synchronously from `lookup`.
        assert!(seen.borrow().is_none());

        for _ in 0..200 {
            if seen.borrow().is_some() {
                break;
            }
            reactor.tick().unwrap();
        }

        let result = seen.borrow_mut().take().expect("lookup should have completed");
        let records = result.expect("127.0.0.1 should resolve");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sockaddr, "127.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(records[0].protocol, IPPROTO_TCP);
    }

    #[test]
    fn empty_result_set_is_reported_as_an_error() {
        let result = resolve_blocking("", 80, SockType::Stream);
        // An empty host string is itself invalid and resolves to nothing on
        // every platform `std::net` supports.
        assert!(result.is_err());
    }
}
