//! Accepts inbound connections and hands each one to the owner as a
//! [`TcpConnection`].
//!
//! Grounded on the teacher's `Listener`/`MultiListener` (`listener.rs`,
//! `multilistener.rs`): a listening socket registered with the shared
//! `mio::Poll`, a `slab::Slab` of connections keyed by token, and an
//! `accept()` loop run until `WouldBlock`. The teacher hands each readiness
//! event off to a worker thread over a `crossbeam_channel`; this crate's
//! reactor is single-threaded by design (spec §4.2), so `TcpServer` instead
//! dispatches in-line via [`crate::reactor::Reactor::on_any_io`].

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use mio::{Registry, Token};
use slab::Slab;

use crate::reactor::{IoEvent, Reactor};

use super::connection::TcpConnection;
use super::tcp_listener::TcpListener;
use super::tcp_stream::TcpStream;

/// Bits of a connection token reserved for the slab key within one server's
/// `connections` table (16M live connections per listener before wrapping).
const CONN_SLOT_BITS: u32 = 24;

/// Tags a token as a `TcpServer` connection (as opposed to a token handed
/// out by [`Reactor::new_source`] for some other owner) and, combined with
/// the server's own `listen_token` in the bits above [`CONN_SLOT_BITS`],
/// keeps every server sharing a reactor in a disjoint token namespace. Both
/// land in the same `mio::Registry`, and mio does not itself detect two
/// registrations sharing a token, so collisions would silently misroute
/// readiness events between unrelated connections.
const CONN_TOKEN_FLAG: usize = 1 << (usize::BITS - 1);

fn conn_token_base(listen_token: Token) -> usize {
    CONN_TOKEN_FLAG | (listen_token.0 << CONN_SLOT_BITS)
}

/// A bound, listening socket wired into a shared [`Reactor`].
///
/// `TcpServer` owns the connection table; the caller supplies callbacks via
/// [`TcpServer::on_connection`] to attach its own `data`/`close` listeners
/// (e.g. feeding bytes to an HTTP codec) to each accepted
/// [`TcpConnection`].
///
/// Connections are held as `Rc<RefCell<TcpConnection<S>>>` rather than owned
/// outright by the slab: an owner that wants to write back to a connection
/// later — after the accept callback returns, from deep inside a parsed-
/// request handler — needs its own clone of the same handle, not a
/// `&mut` borrow scoped to one dispatch call.
pub struct TcpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: TcpStream + Read + Write + mio::event::Source,
{
    listener: L,
    listen_token: Token,
    registry: Registry,
    connections: Slab<Rc<RefCell<TcpConnection<S>>>>,
    on_accept: Option<Box<dyn FnMut(&Rc<RefCell<TcpConnection<S>>>, &Registry)>>,
}

impl<L, S> std::fmt::Debug for TcpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: TcpStream + Read + Write + mio::event::Source,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl<L, S> TcpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source + 'static,
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    /// Binds `listener` into `reactor`. The returned server does not start
    /// accepting until [`TcpServer::listen`] is called, so the owner can
    /// install [`TcpServer::on_connection`] first.
    pub fn bind(reactor: &mut Reactor, mut listener: L) -> io::Result<Self> {
        let listen_token = reactor.new_source();
        let registry = reactor.registry().try_clone()?;
        {
            let source = reactor.source_mut(listen_token).unwrap();
            source.event_add(IoEvent::Readable);
            source.sync(&registry, &mut listener)?;
        }
        Ok(Self {
            listener,
            listen_token,
            registry,
            connections: Slab::new(),
            on_accept: None,
        })
    }

    /// Installs the callback run against every freshly-accepted connection,
    /// before it is registered for readiness. Use this to attach `data`/
    /// `close` listeners (an HTTP codec, typically) and call
    /// `pause(registry, false)` once the owner is ready for bytes.
    pub fn on_connection(&mut self, callback: impl FnMut(&Rc<RefCell<TcpConnection<S>>>, &Registry) + 'static) {
        self.on_accept = Some(Box::new(callback));
    }

    /// Wires this server's accept loop and per-connection dispatch into
    /// `reactor`. Must be called exactly once, after [`TcpServer::bind`].
    pub fn listen(server: std::rc::Rc<std::cell::RefCell<Self>>, reactor: &mut Reactor) {
        let accept_handle = server.clone();
        reactor.on_any_io(move |token, event| {
            let mut server = accept_handle.borrow_mut();
            if token == server.listen_token {
                if event == IoEvent::Readable {
                    let _ = server.accept();
                }
                return;
            }
            server.dispatch_connection(token, event);
        });
    }

    fn accept(&mut self) -> io::Result<()> {
        let registry = self.registry_handle();
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let entry = self.connections.vacant_entry();
                    assert!(entry.key() < (1 << CONN_SLOT_BITS), "connection slab overflowed its token bits");
                    let token = Token(conn_token_base(self.listen_token) | entry.key());
                    let conn = Rc::new(RefCell::new(TcpConnection::new(token, stream, peer_addr)));
                    if let Some(callback) = self.on_accept.as_mut() {
                        callback(&conn, &registry);
                    }
                    entry.insert(conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch_connection(&mut self, token: Token, event: IoEvent) {
        let base = conn_token_base(self.listen_token);
        if token.0 & !((1 << CONN_SLOT_BITS) - 1) != base {
            return; // belongs to a different server (or isn't a connection token at all)
        }
        let slot = token.0 & ((1 << CONN_SLOT_BITS) - 1);
        let registry = self.registry_handle();
        let Some(conn) = self.connections.get(slot).cloned() else {
            return;
        };
        match event {
            IoEvent::Readable => {
                let _ = TcpConnection::handle_readable(&conn, &registry);
            }
            IoEvent::Writable => {
                let _ = TcpConnection::handle_writable(&conn, &registry);
            }
            IoEvent::Error | IoEvent::Close => {
                let _ = TcpConnection::close(&conn, &registry);
            }
        }
        if conn.borrow().is_closed() {
            self.connections.remove(slot);
        }
    }

    fn registry_handle(&self) -> Registry {
        self.registry
            .try_clone()
            .expect("registry handle should always be cloneable")
    }
}
