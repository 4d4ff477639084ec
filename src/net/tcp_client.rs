//! Non-blocking outbound TCP connect, with timeout and IP admission.
//!
//! New relative to the teacher, which never initiates outbound connections.
//! Grounded on the teacher's `net::tcp_stream::TcpStream` trait-over-`mio`
//! indirection (reused here so connect can be driven against a fake stream
//! in unit tests) and on [`crate::reactor::EventSource`] for the
//! writable-readiness watch that detects connect completion.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::events::EventEmitter;
use crate::reactor::{CancelHandle, IoEvent, Reactor};

use super::connection::TcpConnection;
use super::tcp_stream::TcpStream;

/// The `kind` carried on a `connect_error` event, per spec §4.5's
/// `{"socket","gai","ssl","access","retry"}` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// The OS-level connect failed or timed out (`ETIMEDOUT` and friends).
    Socket,
    /// DNS resolution failed (`getaddrinfo`-style error).
    Gai,
    /// TLS handshake failed.
    Ssl,
    /// The `ip_check` predicate rejected the destination before connecting.
    Access,
    /// Every address in the resolved list was exhausted.
    Retry,
}

/// Outcome events a [`TcpClient`] can emit. Exactly one fires per connect
/// attempt, matching spec §4.5's "emits exactly one outcome event".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpClientEvent {
    /// The handshake completed; carries the live connection.
    Connect,
    /// The attempt failed; carries kind/code/message.
    ConnectError,
}

/// Payload for a [`TcpClientEvent`].
///
/// `Connected` wraps its connection in a `RefCell<Option<_>>` rather than
/// handing it over directly: [`EventEmitter::once`] only gives listeners a
/// shared `&TcpClientPayload`, so a listener that wants to take ownership
/// (e.g. [`super::tls_client::connect`] splicing in a handshake) calls
/// `.take()` on the cell instead.
pub enum TcpClientPayload<S: TcpStream + std::io::Read + std::io::Write> {
    /// The established connection, for [`TcpClientEvent::Connect`].
    Connected(std::cell::RefCell<Option<TcpConnection<S>>>),
    /// `(kind, code, message)`, for [`TcpClientEvent::ConnectError`].
    Failed(ConnectErrorKind, i32, String),
}

impl<S: TcpStream + std::io::Read + std::io::Write> std::fmt::Debug for TcpClientPayload<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpClientPayload::Connected(_) => f.debug_tuple("Connected").finish(),
            TcpClientPayload::Failed(kind, code, msg) => {
                f.debug_tuple("Failed").field(kind).field(code).field(msg).finish()
            }
        }
    }
}

/// Drives one non-blocking outbound connect to completion.
///
/// Constructed with [`TcpClient::connect`]; the caller must attach a
/// listener via [`TcpClient::on`] before the first [`Reactor::tick`] after
/// construction, since outcomes (including a same-tick `access` rejection)
/// are always deferred to the next tick rather than fired synchronously
/// from inside `connect()`.
pub struct TcpClient<S: TcpStream + std::io::Read + std::io::Write> {
    emitter: EventEmitter<TcpClientEvent, TcpClientPayload<S>>,
    fired: bool,
    timeout_handle: Option<CancelHandle>,
}

impl<S: TcpStream + std::io::Read + std::io::Write> std::fmt::Debug for TcpClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient").field("fired", &self.fired).finish()
    }
}

impl<S> TcpClient<S>
where
    S: TcpStream + std::io::Read + std::io::Write + mio::event::Source + 'static,
{
    /// Subscribes to the connect outcome.
    pub fn on(&mut self, event: TcpClientEvent, listener: impl FnMut(&TcpClientPayload<S>) + 'static) {
        self.emitter.once(event, listener);
    }

    /// Begins a non-blocking connect to `addr`.
    ///
    /// If `ip_check` is supplied and returns `false` for `addr.ip()`, no
    /// socket is opened and the next tick delivers
    /// `connect_error(Access, 0, _)`. If `timeout` is set and the socket
    /// hasn't become writable by then, the attempt is cancelled and
    /// `connect_error(Socket, ETIMEDOUT, _)` fires.
    pub fn connect(
        reactor: &mut Reactor,
        addr: SocketAddr,
        timeout: Option<Duration>,
        ip_check: Option<&dyn Fn(IpAddr) -> bool>,
    ) -> io::Result<std::rc::Rc<std::cell::RefCell<Self>>> {
        let client = std::rc::Rc::new(std::cell::RefCell::new(Self {
            emitter: EventEmitter::new(),
            fired: false,
            timeout_handle: None,
        }));

        if let Some(check) = ip_check {
            if !check(addr.ip()) {
                let denied = client.clone();
                reactor.schedule(Duration::ZERO, move || {
                    denied.borrow_mut().fire(
                        TcpClientEvent::ConnectError,
                        TcpClientPayload::Failed(ConnectErrorKind::Access, 0, format!("{addr} rejected by ip_check")),
                    );
                });
                return Ok(client);
            }
        }

        let stream = match S::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(0);
                let msg = e.to_string();
                let failed = client.clone();
                reactor.schedule(Duration::ZERO, move || {
                    failed.borrow_mut().fire(
                        TcpClientEvent::ConnectError,
                        TcpClientPayload::Failed(ConnectErrorKind::Socket, code, msg.clone()),
                    );
                });
                return Ok(client);
            }
        };

        let token = reactor.new_source();
        {
            let source = reactor.source_mut(token).unwrap();
            source.event_add(IoEvent::Writable);
        }
        let registry = reactor.registry().try_clone()?;
        let mut stream = stream;
        reactor.source_mut(token).unwrap().sync(&registry, &mut stream)?;
        let mailbox = reactor.mailbox();

        let watched = std::rc::Rc::new(std::cell::RefCell::new(Some(stream)));

        if let Some(delta) = timeout {
            let timeout_client = client.clone();
            let timeout_watched = watched.clone();
            let timeout_registry = registry.try_clone()?;
            let timeout_mailbox = mailbox.clone();
            let handle = reactor.schedule(delta, move || {
                let mut guard = timeout_client.borrow_mut();
                if guard.fired {
                    return;
                }
                if let Some(mut stream) = timeout_watched.borrow_mut().take() {
                    let _ = timeout_registry.deregister(&mut stream);
                }
                timeout_mailbox.post(move |r| r.remove_source(token));
                guard.fire(
                    TcpClientEvent::ConnectError,
                    TcpClientPayload::Failed(ConnectErrorKind::Socket, libc_etimedout(), "connect timed out".into()),
                );
            });
            client.borrow_mut().timeout_handle = Some(handle);
        }

        let ready_client = client.clone();
        let ready_watched = watched.clone();
        let ready_registry = registry;
        reactor.source_mut(token).unwrap().emitter.on(IoEvent::Writable, move |_| {
            let mut guard = ready_client.borrow_mut();
            if guard.fired {
                return;
            }
            let Some(mut stream) = ready_watched.borrow_mut().take() else {
                return;
            };
            if let Some(h) = guard.timeout_handle.take() {
                h.delete();
            }
            mailbox.post(move |r| r.remove_source(token));
            match stream.take_error() {
                Ok(None) => {
                    let peer = stream.peer_addr().unwrap_or(addr);
                    let _ = ready_registry.deregister(&mut stream);
                    guard.fire(
                        TcpClientEvent::Connect,
                        TcpClientPayload::Connected(std::cell::RefCell::new(Some(TcpConnection::new(token, stream, peer)))),
                    );
                }
                Ok(Some(e)) | Err(e) => {
                    let code = e.raw_os_error().unwrap_or(0);
                    let msg = e.to_string();
                    let _ = ready_registry.deregister(&mut stream);
                    guard.fire(
                        TcpClientEvent::ConnectError,
                        TcpClientPayload::Failed(ConnectErrorKind::Socket, code, msg),
                    );
                }
            }
        });

        Ok(client)
    }

    fn fire(&mut self, event: TcpClientEvent, payload: TcpClientPayload<S>) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.emitter.emit(event, &payload);
    }
}

#[cfg(unix)]
fn libc_etimedout() -> i32 {
    110 // ETIMEDOUT on Linux; matches spec §4.5's "emit connect_error(\"socket\", ETIMEDOUT, ...)".
}

#[cfg(not(unix))]
fn libc_etimedout() -> i32 {
    10060 // WSAETIMEDOUT on Windows.
}
