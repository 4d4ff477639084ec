//! The per-origin connection pool (§4.8): DNS -> TCP connect orchestration,
//! idle-connection reuse, and a bounded waiter queue per origin.
//!
//! Grounded on [`super::super::server::server`]'s accept-loop wiring for the
//! idle-sweep and readiness-dispatch shapes, and on
//! [`crate::net::tcp_server::TcpServer`]'s own `on_any_io` dispatcher for the
//! token-keyed table pattern — substituting a `HashMap<Token, _>` for the
//! slab-plus-bitmask scheme, since a pool has no single listening socket to
//! derive a token namespace from.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::{Registry, Token};

use crate::dns::{AddressInfo, AssertSend, Resolver, SockType, ThreadResolver};
use crate::net::connection::TcpConnection;
use crate::net::tcp_client::{TcpClient, TcpClientEvent, TcpClientPayload};
use crate::net::tcp_stream::TcpStream;
use crate::reactor::{IoEvent, MailboxSender, Reactor, ReactorEvent};

use super::super::error::{ConnectError, DnsError as HttpDnsError, HttpError};
use super::super::header::Headers;
use super::super::types::HttpMethod;
use super::super::uri::{Origin, Uri};
use super::exchange::{ClientEvent, ClientPayload, HttpClientExchange};
use super::PendingActions;

/// Configuration for one [`HttpClient`] pool, per §4.8.
#[derive(Clone)]
pub struct HttpClientConfig {
    /// How long an idle connection may sit in the pool before being closed.
    /// Zero disables keep-alive: outbound headers carry `Connection: close`
    /// and connections are never pooled.
    pub idle_timeout: Duration,
    /// Cap on how long a single connect attempt (one address record) may
    /// take before it's abandoned.
    pub connect_timeout: Option<Duration>,
    /// How many address records to try (cycling through the DNS result
    /// list) before giving up on a connection attempt entirely.
    pub connect_attempts: u32,
    /// No bytes arriving for this long while a response is outstanding
    /// tears the connection down. Enforcement lives alongside the idle
    /// sweep in [`HttpClient`]'s own `on_any_io` dispatch.
    pub read_timeout: Option<Duration>,
    /// How many times an idempotent request may be retried on a fresh
    /// connection after a connect failure or an early clean close.
    pub retry_limit: u32,
    /// Delay before a retried request's connection attempt begins.
    pub retry_delay: Duration,
    /// Cap on live connections (established + in-flight connect attempts)
    /// per origin.
    pub max_server_conn: usize,
    /// `true`: tear down a connection at the first non-fatal parsing
    /// anomaly. `false`: parse leniently but mark the connection
    /// non-reusable once an anomaly occurs. Consulted by the caller driving
    /// an exchange's `error` event, not by the pool itself.
    pub careful: bool,
    /// Optional admission predicate run against each candidate address
    /// before connecting.
    pub check_ip: Option<Rc<dyn Fn(IpAddr) -> bool>>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            connect_timeout: Some(Duration::from_secs(10)),
            connect_attempts: 3,
            read_timeout: Some(Duration::from_secs(30)),
            retry_limit: 1,
            retry_delay: Duration::from_millis(250),
            max_server_conn: 6,
            careful: true,
            check_ip: None,
        }
    }
}

type OnConnect<S> = Box<dyn FnOnce(Rc<RefCell<TcpConnection<S>>>)>;
type OnConnectError = Box<dyn FnOnce(Box<dyn HttpError>)>;

struct Waiter<S: TcpStream + Read + Write> {
    on_connect: OnConnect<S>,
    on_error: OnConnectError,
}

struct IdleSlot<S: TcpStream + Read + Write> {
    conn: Rc<RefCell<TcpConnection<S>>>,
    deadline: Instant,
    origin: Origin,
}

struct OriginState<S: TcpStream + Read + Write> {
    /// Established connections currently handed to a waiter/exchange.
    count: usize,
    /// Connect attempts currently in flight for this origin.
    connecting: usize,
    /// Idle connections, most-recently-released at the back.
    idle: VecDeque<Token>,
    waiters: VecDeque<Waiter<S>>,
}

impl<S: TcpStream + Read + Write> Default for OriginState<S> {
    fn default() -> Self {
        Self {
            count: 0,
            connecting: 0,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }
}

struct Inner<S: TcpStream + Read + Write> {
    config: HttpClientConfig,
    registry: Registry,
    mailbox: MailboxSender,
    origins: HashMap<Origin, OriginState<S>>,
    idle_slots: HashMap<Token, IdleSlot<S>>,
    dispatch: HashMap<Token, Rc<RefCell<TcpConnection<S>>>>,
}

/// A connection pool keyed by [`Origin`], driving outbound exchanges over
/// DNS-resolved, pooled TCP connections.
///
/// TLS origins are out of scope for this pool (see `DESIGN.md`'s Open
/// Question decision); [`HttpClient::request`] rejects a `secure` origin
/// with [`ConnectError`].
pub struct HttpClient<S, R = ThreadResolver>
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    inner: Rc<RefCell<Inner<S>>>,
    resolver: R,
}

impl<S, R> std::fmt::Debug for HttpClient<S, R>
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").finish()
    }
}

/// Posts `job` back onto the reactor thread via `mailbox`, using the same
/// [`AssertSend`] idiom [`crate::dns::ThreadResolver`] uses — not to cross a
/// real thread boundary here, but to regain a genuine `&mut Reactor` from
/// inside a callback that was dispatched without one.
fn defer(mailbox: &MailboxSender, job: impl FnOnce(&mut Reactor) + 'static) {
    let job = AssertSend(Box::new(job) as Box<dyn FnOnce(&mut Reactor)>);
    mailbox.post(move |reactor| {
        let job = job;
        (job.0)(reactor)
    });
}

fn dispatch_readiness<S: TcpStream + Read + Write + mio::event::Source + 'static>(
    inner: &Rc<RefCell<Inner<S>>>,
    token: Token,
    event: IoEvent,
) {
    let registry = inner.borrow().registry.try_clone().expect("registry handle should always be cloneable");
    let Some(conn) = inner.borrow().dispatch.get(&token).cloned() else {
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
        inner.borrow_mut().dispatch.remove(&token);
        inner.borrow_mut().idle_slots.remove(&token);
    }
}

fn sweep_idle<S: TcpStream + Read + Write + mio::event::Source>(inner: &Rc<RefCell<Inner<S>>>) {
    let now = Instant::now();
    let overdue: Vec<Token> = inner
        .borrow()
        .idle_slots
        .iter()
        .filter(|(_, slot)| now >= slot.deadline || slot.conn.borrow().is_closed())
        .map(|(token, _)| *token)
        .collect();
    for token in overdue {
        let mut inner_mut = inner.borrow_mut();
        let Some(slot) = inner_mut.idle_slots.remove(&token) else { continue };
        inner_mut.dispatch.remove(&token);
        if let Some(state) = inner_mut.origins.get_mut(&slot.origin) {
            state.idle.retain(|t| *t != token);
        }
        let registry = inner_mut.registry.try_clone().expect("registry handle should always be cloneable");
        drop(inner_mut);
        let _ = TcpConnection::end(&slot.conn, &registry);
    }
}

fn close_all_idle<S: TcpStream + Read + Write + mio::event::Source>(inner: &Rc<RefCell<Inner<S>>>) {
    let slots: Vec<_> = inner.borrow_mut().idle_slots.drain().collect();
    let registry = inner.borrow().registry.try_clone().expect("registry handle should always be cloneable");
    for (_, slot) in slots {
        let _ = TcpConnection::end(&slot.conn, &registry);
    }
}

impl<S> HttpClient<S, ThreadResolver>
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    /// Builds a pool using [`ThreadResolver`] for DNS.
    pub fn new(reactor: &mut Reactor, config: HttpClientConfig) -> std::io::Result<Rc<RefCell<Self>>> {
        Self::with_resolver(reactor, config, ThreadResolver::new())
    }
}

impl<S, R> HttpClient<S, R>
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    /// Builds a pool with a caller-supplied [`Resolver`], for tests that
    /// want a deterministic fake.
    pub fn with_resolver(reactor: &mut Reactor, config: HttpClientConfig, resolver: R) -> std::io::Result<Rc<RefCell<Self>>> {
        let registry = reactor.registry().try_clone()?;
        let inner = Rc::new(RefCell::new(Inner {
            config,
            registry,
            mailbox: reactor.mailbox(),
            origins: HashMap::new(),
            idle_slots: HashMap::new(),
            dispatch: HashMap::new(),
        }));

        {
            let inner = inner.clone();
            reactor.on_any_io(move |token, event| dispatch_readiness(&inner, token, event));
        }
        {
            let inner = inner.clone();
            reactor.on_any_io(move |_token, _event| sweep_idle(&inner));
        }
        {
            let inner = inner.clone();
            reactor.on(ReactorEvent::Stop, move |_| close_all_idle(&inner));
        }

        Ok(Rc::new(RefCell::new(Self { inner, resolver })))
    }

    /// Attaches a connection for `origin` to the caller, per §4.8's
    /// `attach_conn` algorithm: reuse an idle connection if one exists,
    /// start a new connect if the origin is under `max_server_conn`,
    /// otherwise queue behind existing waiters.
    pub fn attach_conn(
        &self,
        reactor: &mut Reactor,
        origin: Origin,
        on_connect: impl FnOnce(Rc<RefCell<TcpConnection<S>>>) + 'static,
        on_error: impl FnOnce(Box<dyn HttpError>) + 'static,
    ) {
        let reused = loop {
            let mut inner = self.inner.borrow_mut();
            let state = inner.origins.entry(origin.clone()).or_default();
            let Some(token) = state.idle.pop_back() else { break None };
            let Some(slot) = inner.idle_slots.remove(&token) else { continue };
            if slot.conn.borrow().is_closed() {
                inner.dispatch.remove(&token);
                continue;
            }
            break Some(slot.conn);
        };
        if let Some(conn) = reused {
            on_connect(conn);
            return;
        }

        let should_connect = {
            let mut inner = self.inner.borrow_mut();
            let max = inner.config.max_server_conn;
            let state = inner.origins.entry(origin.clone()).or_default();
            let should = state.count + state.connecting < max;
            state.waiters.push_back(Waiter {
                on_connect: Box::new(on_connect),
                on_error: Box::new(on_error),
            });
            if should {
                state.connecting += 1;
            }
            should
        };
        if should_connect {
            start_connect(self.inner.clone(), self.resolver.clone(), reactor, origin);
        }
    }

    /// Returns a connection to the pool, per §4.8's `release_conn`
    /// algorithm: hand it straight to a waiter if one exists, otherwise park
    /// it in the idle list (or close it outright if keep-alive is
    /// disabled).
    pub fn release_conn(&self, origin: &Origin, conn: Rc<RefCell<TcpConnection<S>>>) {
        conn.borrow_mut().clear_listeners();

        let waiter = {
            let mut inner = self.inner.borrow_mut();
            inner.origins.get_mut(origin).and_then(|state| state.waiters.pop_front())
        };
        if let Some(waiter) = waiter {
            (waiter.on_connect)(conn);
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if inner.config.idle_timeout.is_zero() {
            let registry = inner.registry.try_clone().expect("registry handle should always be cloneable");
            drop(inner);
            let _ = TcpConnection::end(&conn, &registry);
            return;
        }

        let token = conn.borrow().token();
        let deadline = Instant::now() + inner.config.idle_timeout;
        inner.idle_slots.insert(
            token,
            IdleSlot {
                conn: conn.clone(),
                deadline,
                origin: origin.clone(),
            },
        );
        inner.dispatch.insert(token, conn);
        inner.origins.entry(origin.clone()).or_default().idle.push_back(token);
    }

    /// Reports a connection as permanently gone (closed, errored, or torn
    /// down after a non-recoverable parse failure), per §4.8's `dead_conn`
    /// algorithm: decrements the origin's count, and if that drops it to
    /// zero while waiters remain, starts a fresh connect for the next one.
    pub fn dead_conn(&self, origin: &Origin) {
        let should_connect = {
            let mut inner = self.inner.borrow_mut();
            let Some(state) = inner.origins.get_mut(origin) else { return };
            state.count = state.count.saturating_sub(1);
            let should = state.count == 0 && state.connecting == 0 && !state.waiters.is_empty();
            if should {
                state.connecting += 1;
            }
            should
        };
        if !should_connect {
            return;
        }
        let mailbox = self.inner.borrow().mailbox.clone();
        let inner = self.inner.clone();
        let resolver = self.resolver.clone();
        let origin = origin.clone();
        defer(&mailbox, move |reactor| start_connect(inner, resolver, reactor, origin));
    }

    /// A convenience wrapping `attach_conn` and an [`HttpClientExchange`]
    /// end to end: attaches a connection, writes `method`/`uri`/`headers`
    /// plus an optional whole request body, hands the exchange to
    /// `on_exchange` for the caller to subscribe to response events on, and
    /// releases or kills the connection once the exchange finishes —
    /// retrying on a fresh connection per §4.7's retry policy when the
    /// method is idempotent and a connect error or early clean close
    /// occurs.
    pub fn request(
        &self,
        reactor: &mut Reactor,
        method: HttpMethod,
        uri: Uri,
        headers: Headers,
        body: Option<Vec<u8>>,
        on_exchange: impl FnMut(&mut HttpClientExchange<S>) + 'static,
        on_error: impl FnOnce(Box<dyn HttpError>) + 'static,
    ) {
        if uri.secure {
            on_error(Box::new(ConnectError::new("TLS origins are not supported by this pool")));
            return;
        }
        let ctx = Rc::new(RequestCtx {
            pool_inner: self.inner.clone(),
            resolver: self.resolver.clone(),
            origin: uri.origin(),
            method,
            uri,
            headers,
            body,
            attempt: Cell::new(0),
            on_exchange: RefCell::new(Box::new(on_exchange)),
            on_error: RefCell::new(Some(Box::new(on_error))),
        });
        run_attempt(ctx, reactor);
    }
}

struct RequestCtx<S: TcpStream + Read + Write + mio::event::Source + 'static, R: Resolver + Clone + 'static> {
    pool_inner: Rc<RefCell<Inner<S>>>,
    resolver: R,
    origin: Origin,
    method: HttpMethod,
    uri: Uri,
    headers: Headers,
    body: Option<Vec<u8>>,
    attempt: Cell<u32>,
    on_exchange: RefCell<Box<dyn FnMut(&mut HttpClientExchange<S>)>>,
    on_error: RefCell<Option<Box<dyn FnOnce(Box<dyn HttpError>)>>>,
}

fn run_attempt<S, R>(ctx: Rc<RequestCtx<S, R>>, reactor: &mut Reactor)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let pool = HttpClient {
        inner: ctx.pool_inner.clone(),
        resolver: ctx.resolver.clone(),
    };
    let idle_timeout = ctx.pool_inner.borrow().config.idle_timeout;

    let success_ctx = ctx.clone();
    let error_ctx = ctx.clone();

    pool.attach_conn(
        reactor,
        ctx.origin.clone(),
        move |conn| on_attached(success_ctx, conn, idle_timeout),
        move |err| on_connect_failed(error_ctx, err),
    );
}

fn on_attached<S, R>(ctx: Rc<RequestCtx<S, R>>, conn: Rc<RefCell<TcpConnection<S>>>, idle_timeout: Duration)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let registry = ctx.pool_inner.borrow().registry.try_clone().expect("registry handle should always be cloneable");
    let careful = ctx.pool_inner.borrow().config.careful;
    let actions: PendingActions = Rc::new(RefCell::new(Vec::new()));
    let exchange = Rc::new(RefCell::new(HttpClientExchange::wire(conn.clone(), &registry, actions, careful)));

    let will_stream = false; // the whole body (if any) is known up front, matching the server side's buffer-then-dispatch shape
    let write_result = exchange.borrow_mut().request_start(ctx.method.clone(), &ctx.uri, ctx.headers.clone(), idle_timeout, will_stream);
    if write_result.is_err() {
        let _ = TcpConnection::end(&conn, &registry);
        let pool = HttpClient {
            inner: ctx.pool_inner.clone(),
            resolver: ctx.resolver.clone(),
        };
        pool.dead_conn(&ctx.origin);
        if let Some(cb) = ctx.on_error.borrow_mut().take() {
            cb(Box::new(ConnectError::new("failed to write request head")));
        }
        return;
    }
    if let Some(b) = &ctx.body {
        let _ = exchange.borrow_mut().request_body(b);
    }
    let _ = exchange.borrow_mut().request_done(Headers::new());

    let done_ctx = ctx.clone();
    let done_conn = conn.clone();
    let done_exchange = exchange.clone();
    exchange.borrow_mut().on(ClientEvent::ResponseDone, move |_| {
        finish_exchange(done_ctx.clone(), done_conn.clone(), &done_exchange);
    });

    let err_ctx = ctx.clone();
    let err_conn = conn.clone();
    exchange.borrow_mut().on(ClientEvent::Error, move |payload| {
        let ClientPayload::Error(_) = payload else { return };
        let pool = HttpClient {
            inner: err_ctx.pool_inner.clone(),
            resolver: err_ctx.resolver.clone(),
        };
        pool.dead_conn(&err_ctx.origin);
        // Clear listeners first so ending the connection here doesn't
        // re-trigger the `Close` listener below, which exists to catch a
        // close observed *without* an `error`/`response_done` of its own.
        err_conn.borrow_mut().clear_listeners();
        let _ = TcpConnection::end(&err_conn, &registry_of(&err_ctx));
        fail_or_retry(err_ctx.clone(), Box::new(ConnectError::new("response parsing failed")));
    });

    // Early clean close while still waiting for the response head, per
    // §4.7's retry policy.
    let close_ctx = ctx.clone();
    let close_exchange = exchange.clone();
    let close_origin = ctx.origin.clone();
    conn.borrow_mut().on(crate::net::connection::ConnEvent::Close, move |_| {
        if !close_exchange.borrow().awaiting_response_head() {
            return;
        }
        let pool = HttpClient {
            inner: close_ctx.pool_inner.clone(),
            resolver: close_ctx.resolver.clone(),
        };
        pool.dead_conn(&close_origin);
        fail_or_retry(close_ctx.clone(), Box::new(ConnectError::new("connection closed before any response arrived")));
    });

    (ctx.on_exchange.borrow_mut())(&mut exchange.borrow_mut());
}

fn registry_of<S, R>(ctx: &RequestCtx<S, R>) -> Registry
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    ctx.pool_inner.borrow().registry.try_clone().expect("registry handle should always be cloneable")
}

fn finish_exchange<S, R>(ctx: Rc<RequestCtx<S, R>>, conn: Rc<RefCell<TcpConnection<S>>>, exchange: &Rc<RefCell<HttpClientExchange<S>>>)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let pool = HttpClient {
        inner: ctx.pool_inner.clone(),
        resolver: ctx.resolver.clone(),
    };
    if exchange.borrow().is_reusable() && !conn.borrow().is_closed() {
        {
            let mut inner = ctx.pool_inner.borrow_mut();
            inner.origins.entry(ctx.origin.clone()).or_default();
        }
        pool.release_conn(&ctx.origin, conn);
    } else {
        pool.dead_conn(&ctx.origin);
    }
}

fn on_connect_failed<S, R>(ctx: Rc<RequestCtx<S, R>>, err: Box<dyn HttpError>)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    fail_or_retry(ctx, err);
}

fn fail_or_retry<S, R>(ctx: Rc<RequestCtx<S, R>>, err: Box<dyn HttpError>)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let idempotent = ctx.method.is_idempotent();
    let retry_limit = ctx.pool_inner.borrow().config.retry_limit;
    let attempt = ctx.attempt.get();
    if !idempotent || attempt >= retry_limit {
        if let Some(cb) = ctx.on_error.borrow_mut().take() {
            cb(err);
        }
        return;
    }
    ctx.attempt.set(attempt + 1);
    let delay = ctx.pool_inner.borrow().config.retry_delay;
    let mailbox = ctx.pool_inner.borrow().mailbox.clone();
    defer(&mailbox, move |reactor| {
        let retry_ctx = ctx.clone();
        reactor.schedule(delay, move || {
            // `schedule`'s callback runs without a held `&mut Reactor` of
            // its own — see the mailbox-deferral note on `defer` — so hop
            // back through the mailbox once more to get one for the actual
            // retry attempt.
            let inner_ctx = retry_ctx.clone();
            let mailbox = inner_ctx.pool_inner.borrow().mailbox.clone();
            defer(&mailbox, move |reactor| run_attempt(inner_ctx.clone(), reactor));
        });
    });
}

/// Starts resolving `origin`, per §4.8: look up every address record, then
/// hand the list to [`connect_record`] to cycle through on connect failure.
fn start_connect<S, R>(inner: Rc<RefCell<Inner<S>>>, resolver: R, reactor: &mut Reactor, origin: Origin)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let host = origin.host.clone();
    let port = origin.port;
    let mailbox = inner.borrow().mailbox.clone();
    let lookup_inner = inner.clone();
    let lookup_resolver = resolver.clone();
    let lookup_origin = origin.clone();

    resolver.lookup(reactor, &host, port, SockType::Stream, move |result| {
        defer(&mailbox, move |reactor| match result {
            Ok(records) => connect_record(lookup_inner, lookup_resolver, reactor, lookup_origin, Rc::new(records), 0, None),
            Err(e) => fail_connect(lookup_inner, lookup_resolver, lookup_origin, Box::new(HttpDnsError::new(e.to_string()))),
        });
    });
}

/// Attempts a connect against `records[attempt % records.len()]`, cycling to
/// the next record (and giving up after `connect_attempts`) on failure, per
/// §4.8. `last_error` carries the most recent failure's detail forward so
/// that a final exhaustion reports something more useful than a generic
/// message.
fn connect_record<S, R>(
    inner: Rc<RefCell<Inner<S>>>,
    resolver: R,
    reactor: &mut Reactor,
    origin: Origin,
    records: Rc<Vec<AddressInfo>>,
    attempt: u32,
    last_error: Option<String>,
) where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let (connect_attempts, connect_timeout, check_ip) = {
        let inner = inner.borrow();
        (inner.config.connect_attempts, inner.config.connect_timeout, inner.config.check_ip.clone())
    };
    if records.is_empty() || attempt >= connect_attempts {
        let detail = last_error.unwrap_or_else(|| "exhausted every resolved address".to_string());
        fail_connect(inner, resolver, origin, Box::new(ConnectError::new(detail)));
        return;
    }

    let addr = records[(attempt as usize) % records.len()].sockaddr;
    let client = match TcpClient::connect(reactor, addr, connect_timeout, check_ip.as_deref()) {
        Ok(client) => client,
        Err(e) => {
            connect_record(inner, resolver, reactor, origin, records, attempt + 1, Some(e.to_string()));
            return;
        }
    };

    let mailbox = inner.borrow().mailbox.clone();

    let ok_inner = inner.clone();
    let ok_origin = origin.clone();
    client.borrow_mut().on(TcpClientEvent::Connect, move |payload| {
        let TcpClientPayload::Connected(cell) = payload else { return };
        let Some(conn) = cell.borrow_mut().take() else { return };
        on_connected(&ok_inner, conn, &ok_origin);
    });

    client.borrow_mut().on(TcpClientEvent::ConnectError, move |payload| {
        let TcpClientPayload::Failed(_, _, message) = payload else { return };
        let message = message.clone();
        let retry_inner = inner.clone();
        let retry_resolver = resolver.clone();
        let retry_origin = origin.clone();
        let retry_records = records.clone();
        defer(&mailbox, move |reactor| {
            connect_record(retry_inner, retry_resolver, reactor, retry_origin, retry_records, attempt + 1, Some(message));
        });
    });
}

/// Finishes a successful connect: re-arms readiness (`TcpClient::connect`
/// deregisters the stream right before firing its outcome event), files the
/// connection into the pool's dispatch table, and hands it to the next
/// waiter — or parks it idle if, by the time the connect resolved, nothing
/// is waiting for it any more.
fn on_connected<S: TcpStream + Read + Write + mio::event::Source + 'static>(
    inner: &Rc<RefCell<Inner<S>>>,
    mut conn: TcpConnection<S>,
    origin: &Origin,
) {
    let registry = inner.borrow().registry.try_clone().expect("registry handle should always be cloneable");
    let _ = conn.pause(&registry, false);
    let conn = Rc::new(RefCell::new(conn));
    let token = conn.borrow().token();

    let waiter = {
        let mut inner_mut = inner.borrow_mut();
        inner_mut.dispatch.insert(token, conn.clone());
        let state = inner_mut.origins.entry(origin.clone()).or_default();
        state.connecting = state.connecting.saturating_sub(1);
        state.count += 1;
        state.waiters.pop_front()
    };

    match waiter {
        Some(waiter) => (waiter.on_connect)(conn),
        None => {
            let mut inner_mut = inner.borrow_mut();
            let deadline = Instant::now() + inner_mut.config.idle_timeout;
            inner_mut.idle_slots.insert(
                token,
                IdleSlot {
                    conn,
                    deadline,
                    origin: origin.clone(),
                },
            );
            inner_mut.origins.entry(origin.clone()).or_default().idle.push_back(token);
        }
    }
}

/// Fails exactly one waiter for a connect attempt that never produced a
/// connection, per §4.8: pop one waiter off the queue and report the error
/// to it alone, then restart a connect for whatever waiters remain if none
/// is already in flight and no established connection survives.
fn fail_connect<S, R>(inner: Rc<RefCell<Inner<S>>>, resolver: R, origin: Origin, err: Box<dyn HttpError>)
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
    R: Resolver + Clone + 'static,
{
    let (waiter, restart) = {
        let mut inner_mut = inner.borrow_mut();
        let Some(state) = inner_mut.origins.get_mut(&origin) else {
            return;
        };
        state.connecting = state.connecting.saturating_sub(1);
        let waiter = state.waiters.pop_front();
        let restart = !state.waiters.is_empty() && state.connecting == 0 && state.count == 0;
        if restart {
            state.connecting += 1;
        }
        (waiter, restart)
    };
    if let Some(waiter) = waiter {
        (waiter.on_error)(err);
    }
    if restart {
        let mailbox = inner.borrow().mailbox.clone();
        defer(&mailbox, move |reactor| start_connect(inner, resolver, reactor, origin));
    }
}
