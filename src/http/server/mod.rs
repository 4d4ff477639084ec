//! The HTTP server side: runs the shared codec over each accepted
//! connection, enforces §4.9's request-validation rules (`Host` required,
//! only `identity`/`chunked` transfer codings accepted), and hands the
//! application one [`HttpServerExchange`] per completed request head.
//!
//! Grounded on the teacher's `Listener`/`MultiListener` accept loop plus
//! `worker.rs`'s per-event `Response::new_with_status_line` construction —
//! generalized from "parse one `H1Request`, build one canned response" to
//! running the shared incremental codec and constructing an application-
//! visible exchange object per request.

pub mod exchange;
pub mod server;

pub use exchange::{reason_phrase, HttpServerExchange};
pub use server::HttpServer;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::{Rc, Weak};

use mio::Registry;

use crate::net::connection::TcpConnection;
use crate::net::tcp_stream::TcpStream;

use super::codec::{CodecObserver, HttpMessageHandler, ParsedHead};
use super::error::{HostRequiredError, HttpError, TransferCodeError};
use super::header::Headers;
use super::types::{HttpMethod, HttpVersion, StatusCode};

/// Request-handler callback an [`HttpServer`] invokes once per completed
/// request head.
pub type RequestHandler<S> = dyn FnMut(HttpServerExchange<S>);

/// Work queued by [`ServerObserver`] while it's running *inside* the
/// connection's own `codec.borrow_mut()` (i.e. from within
/// [`super::super::codec::HttpMessageHandler::handle_input`]), to be run
/// immediately after that borrow is released.
///
/// Both [`ServerObserver::fail`] and the normal `input_end` path hand an
/// [`HttpServerExchange`] to application code that may call straight back
/// into `respond`/`respond_streaming`, which needs its own `codec.borrow_mut()`
/// — on the very same `Rc<RefCell<_>>` `handle_input`'s caller is already
/// holding borrowed. Running that call synchronously would be a reentrant
/// double borrow and panic (`already mutably borrowed`); queueing it here and
/// draining the queue from [`server::wire_connection`] after `handle_input`
/// returns keeps application code's "respond synchronously inside the
/// request handler" contract while sidestepping the double borrow.
pub(super) type PendingActions = Rc<RefCell<Vec<Box<dyn FnOnce()>>>>;

struct PendingRequest {
    method: HttpMethod,
    target: Box<str>,
    version: HttpVersion,
    headers: Headers,
    body: Vec<u8>,
}

/// The [`CodecObserver`] driving one server connection: validates each
/// parsed head per §4.9, accumulates the body, and constructs an
/// [`HttpServerExchange`] once the request is fully received.
pub struct ServerObserver<S: TcpStream + Read + Write + mio::event::Source> {
    conn: Rc<RefCell<TcpConnection<S>>>,
    registry: Registry,
    on_request: Rc<RefCell<RequestHandler<S>>>,
    codec: RefCell<Option<Weak<RefCell<HttpMessageHandler<ServerObserver<S>>>>>>,
    pending: Option<PendingRequest>,
    actions: PendingActions,
}

impl<S: TcpStream + Read + Write> std::fmt::Debug for ServerObserver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerObserver").field("has_pending", &self.pending.is_some()).finish()
    }
}

impl<S: TcpStream + Read + Write + mio::event::Source + 'static> ServerObserver<S> {
    fn new(
        conn: Rc<RefCell<TcpConnection<S>>>,
        registry: Registry,
        on_request: Rc<RefCell<RequestHandler<S>>>,
        actions: PendingActions,
    ) -> Self {
        Self {
            conn,
            registry,
            on_request,
            codec: RefCell::new(None),
            pending: None,
            actions,
        }
    }

    /// Wired in by [`server::HttpServer`] immediately after the codec is
    /// placed behind its `Rc<RefCell<_>>`, following the same
    /// construct-then-link pattern [`crate::reactor::Reactor`] uses for
    /// its own owner back-references (see `DESIGN.md`).
    fn bind_codec(&self, codec: &Rc<RefCell<HttpMessageHandler<Self>>>) {
        *self.codec.borrow_mut() = Some(Rc::downgrade(codec));
    }

    fn fail(&mut self, status: StatusCode, err: Box<dyn HttpError>) {
        log::debug!("server request rejected: {err}");
        let Some(codec) = self.codec.borrow().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let mut exchange = self.exchange_for(&codec, HttpVersion::H1_1, HttpMethod::Get, "");
        let conn = self.conn.clone();
        let registry = self.registry.try_clone().expect("registry handle should always be cloneable");
        self.actions.borrow_mut().push(Box::new(move || {
            let _ = exchange.respond_error(status, err.as_ref());
            let _ = TcpConnection::end(&conn, &registry);
        }));
    }

    fn exchange_for(
        &self,
        codec: &Rc<RefCell<HttpMessageHandler<Self>>>,
        version: HttpVersion,
        method: HttpMethod,
        target: &str,
    ) -> HttpServerExchange<S> {
        HttpServerExchange {
            conn: self.conn.clone(),
            codec: codec.clone(),
            registry: self.registry.try_clone().expect("registry handle should always be cloneable"),
            method,
            target: target.into(),
            version,
            request_headers: Headers::new(),
            responded: false,
        }
    }
}

impl<S: TcpStream + Read + Write + mio::event::Source + 'static> CodecObserver for ServerObserver<S> {
    fn input_start(&mut self, head: &ParsedHead) -> (bool, bool) {
        let mut parts = head.top_line.splitn(3, |&b| b == b' ');
        let method_tok = parts.next().unwrap_or(&[]);
        let target_tok = parts.next().unwrap_or(&[]);
        let version_tok = parts.next().unwrap_or(&[]);

        let (Some(method), Some(version)) = (HttpMethod::parse(method_tok), HttpVersion::parse(version_tok)) else {
            self.fail(StatusCode::BAD_REQUEST, Box::new(super::error::StartLineError::new("unparseable request line")));
            return (false, true);
        };

        if version == HttpVersion::H1_1 && head.headers.get_first(b"Host").is_none() {
            self.fail(
                StatusCode::BAD_REQUEST,
                Box::new(HostRequiredError::new("HTTP/1.1 requests must carry a Host header")),
            );
            return (false, true);
        }

        for code in &head.transfer_codes {
            if code != "identity" && code != "chunked" {
                self.fail(
                    StatusCode::NOT_IMPLEMENTED,
                    Box::new(TransferCodeError::new(format!("unsupported transfer coding {code:?}"))),
                );
                return (false, true);
            }
        }

        self.pending = Some(PendingRequest {
            method,
            target: String::from_utf8_lossy(target_tok).into_owned().into_boxed_str(),
            version,
            headers: head.headers.clone(),
            body: Vec::new(),
        });

        (true, true)
    }

    fn input_body(&mut self, chunk: &[u8]) {
        if let Some(pending) = self.pending.as_mut() {
            pending.body.extend_from_slice(chunk);
        }
    }

    fn input_end(&mut self, _trailers: Headers) {
        let Some(pending) = self.pending.take() else { return };
        let Some(codec) = self.codec.borrow().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let exchange = HttpServerExchange {
            conn: self.conn.clone(),
            codec,
            registry: self.registry.try_clone().expect("registry handle should always be cloneable"),
            method: pending.method,
            target: pending.target,
            version: pending.version,
            request_headers: pending.headers,
            responded: false,
        };
        let on_request = self.on_request.clone();
        self.actions.borrow_mut().push(Box::new(move || (on_request.borrow_mut())(exchange)));
    }

    fn input_error(&mut self, err: Box<dyn HttpError>, _fatal: bool) {
        // The server side never sets `careful=false` (no server-facing
        // config exposes it), so every `input_error` the request codec
        // raises is fatal in practice; `_fatal` is kept only to satisfy
        // the shared `CodecObserver` contract.
        let status = err.server_status().unwrap_or(StatusCode::BAD_REQUEST);
        self.fail(status, err);
    }
}
