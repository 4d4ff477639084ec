//! Binds a listener, runs the shared HTTP codec over every accepted
//! connection, and applies §4.9's idle-close rule: once an exchange
//! completes, a connection that sees no further bytes within `idle_timeout`
//! is closed.
//!
//! Grounded on the accept loop's own source, `MultiListener::run` (a bound
//! listening socket dispatched in-line rather than off to a worker thread);
//! new relative to that original is the per-connection codec wiring and
//! idle timer, since the original replies to one parsed request and closes
//! rather than keeping a connection alive across an idle window.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::{Registry, Token};

use crate::net::connection::{ConnEvent, ConnPayload, TcpConnection};
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_server::TcpServer;
use crate::net::tcp_stream::TcpStream;
use crate::reactor::Reactor;

use super::super::codec::HttpMessageHandler;
use super::{HttpServerExchange, PendingActions, RequestHandler, ServerObserver};

/// One tracked idle connection: the deadline it must see new bytes by, and
/// the handle needed to close it if it doesn't.
struct IdleEntry<S: TcpStream + Read + Write> {
    deadline: Instant,
    conn: Rc<RefCell<TcpConnection<S>>>,
    registry: Registry,
}

/// Connections with an exchange finished and an idle deadline pending,
/// keyed by connection token. Swept on every reactor readiness event (see
/// `HttpServer::bind`) rather than through a per-connection
/// [`Reactor::schedule`] timer — by the time an exchange completes deep
/// inside a dispatched `data` event, the `&mut Reactor` `bind` was given has
/// long since been returned to the application's own `run()` loop, the same
/// reason [`crate::net::TcpClient`]/[`TcpServer`] only ever call `schedule`
/// from their own top-level `bind`/`connect`, never from nested dispatch.
type IdleTable<S> = Rc<RefCell<HashMap<Token, IdleEntry<S>>>>;

/// An HTTP/1.1 server bound to one listening socket.
///
/// Held by the caller only to keep the underlying [`TcpServer`] alive —
/// once [`HttpServer::bind`] returns, the reactor drives everything through
/// callbacks already wired in.
pub struct HttpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    tcp: Rc<RefCell<TcpServer<L, S>>>,
}

impl<L, S> fmt::Debug for HttpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer").finish()
    }
}

impl<L, S> HttpServer<L, S>
where
    L: TcpListener<S> + mio::event::Source + 'static,
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    /// Binds `listener` and starts serving requests through it, invoking
    /// `on_request` once per completed request head (per §4.9).
    ///
    /// A zero `idle_timeout` disables the keep-alive close entirely —
    /// connections are then kept open for as long as the peer keeps them
    /// open.
    pub fn bind(
        reactor: &mut Reactor,
        listener: L,
        idle_timeout: Duration,
        on_request: impl FnMut(HttpServerExchange<S>) + 'static,
    ) -> std::io::Result<Rc<RefCell<Self>>> {
        let tcp = Rc::new(RefCell::new(TcpServer::bind(reactor, listener)?));
        let on_request: Rc<RefCell<RequestHandler<S>>> = Rc::new(RefCell::new(on_request));
        let idle_table: IdleTable<S> = Rc::new(RefCell::new(HashMap::new()));

        {
            let on_request = on_request.clone();
            let idle_table = idle_table.clone();
            tcp.borrow_mut().on_connection(move |conn, registry| {
                wire_connection(conn.clone(), registry, idle_timeout, on_request.clone(), idle_table.clone());
            });
        }

        if !idle_timeout.is_zero() {
            let idle_table = idle_table.clone();
            reactor.on_any_io(move |_token, _event| sweep_idle(&idle_table));
        }

        TcpServer::listen(tcp.clone(), reactor);

        Ok(Rc::new(RefCell::new(Self { tcp })))
    }
}

fn sweep_idle<S: TcpStream + Read + Write + mio::event::Source>(idle_table: &IdleTable<S>) {
    let now = Instant::now();
    let overdue: Vec<Token> = idle_table
        .borrow()
        .iter()
        .filter(|(_, entry)| now >= entry.deadline || entry.conn.borrow().is_closed())
        .map(|(token, _)| *token)
        .collect();
    let mut table = idle_table.borrow_mut();
    for token in overdue {
        if let Some(entry) = table.remove(&token) {
            let _ = TcpConnection::end(&entry.conn, &entry.registry);
        }
    }
}

fn wire_connection<S: TcpStream + Read + Write + mio::event::Source + 'static>(
    conn: Rc<RefCell<TcpConnection<S>>>,
    registry: &Registry,
    idle_timeout: Duration,
    on_request: Rc<RefCell<RequestHandler<S>>>,
    idle_table: IdleTable<S>,
) {
    let registry = registry.try_clone().expect("registry handle should always be cloneable");
    let token = conn.borrow().token();

    let wrapped: Rc<RefCell<RequestHandler<S>>> = {
        let conn = conn.clone();
        let registry = registry.try_clone().expect("registry handle should always be cloneable");
        let idle_table = idle_table.clone();
        Rc::new(RefCell::new(move |exchange: HttpServerExchange<S>| {
            (on_request.borrow_mut())(exchange);
            if idle_timeout.is_zero() {
                return;
            }
            let entry_registry = registry.try_clone().expect("registry handle should always be cloneable");
            idle_table.borrow_mut().insert(
                token,
                IdleEntry {
                    deadline: Instant::now() + idle_timeout,
                    conn: conn.clone(),
                    registry: entry_registry,
                },
            );
        }))
    };

    let actions: PendingActions = Rc::new(RefCell::new(Vec::new()));

    let observer = ServerObserver::new(
        conn.clone(),
        registry.try_clone().expect("registry handle should always be cloneable"),
        wrapped,
        actions.clone(),
    );
    let codec = Rc::new(RefCell::new(HttpMessageHandler::new(observer)));
    codec.borrow().observer().bind_codec(&codec);

    {
        let codec = codec.clone();
        conn.borrow_mut().on(ConnEvent::Data, move |payload| {
            idle_table.borrow_mut().remove(&token);
            if let ConnPayload::Bytes(bytes) = payload {
                codec.borrow_mut().handle_input(bytes);
            }
            // Run deferred application callbacks only after the codec's own
            // borrow above is released — see `PendingActions`.
            let ready: Vec<_> = actions.borrow_mut().drain(..).collect();
            for action in ready {
                action();
            }
        });
    }

    let _ = conn.borrow_mut().pause(&registry, false);
}
