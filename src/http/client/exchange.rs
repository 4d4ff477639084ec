//! One outbound request/response exchange over a connection the pool has
//! already established.
//!
//! Grounded on the teacher's `worker.rs`, run in reverse: instead of parsing
//! an inbound request and building an outbound response, this builds an
//! outbound request and parses an inbound response. The shared codec
//! (`super::super::codec`) and its `CodecObserver` seam are exactly what
//! [`super::super::server::ServerObserver`] uses; only which side writes and
//! which side parses is flipped.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use mio::Registry;

use crate::events::EventEmitter;
use crate::net::connection::TcpConnection;
use crate::net::tcp_stream::TcpStream;

use super::super::codec::{CodecObserver, Delimiter, HttpMessageHandler, ParsedHead};
use super::super::error::HttpError;
use super::super::header::{Headers, HOP_BY_HOP};
use super::super::types::{HttpMethod, HttpVersion, StatusCode};
use super::super::uri::Uri;
use super::PendingActions;

/// Events an [`HttpClientExchange`] emits, per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A final (non-1xx) status line and header block have been parsed.
    ResponseStart,
    /// A 1xx interim response was received; the exchange stays open,
    /// waiting for the real final response on the same connection.
    ResponseNonfinal,
    /// A chunk of response body bytes.
    ResponseBody,
    /// The response is fully received.
    ResponseDone,
    /// The exchange failed; no further events follow.
    Error,
    /// The transport's outbound queue crossed (`true`) or drained back
    /// below (`false`) its high-water mark.
    Pause,
}

/// Payload carried by a [`ClientEvent`].
pub enum ClientPayload {
    /// `(status, reason, headers)`, for `ResponseStart`/`ResponseNonfinal`.
    Start(StatusCode, Box<str>, Headers),
    /// One delimited chunk of response body.
    Body(Box<[u8]>),
    /// Response trailers (empty unless the body was chunked), for `ResponseDone`.
    Done(Headers),
    /// The error that ended the exchange.
    Error(Box<dyn HttpError>),
    /// Outbound backpressure flag, for `Pause`.
    Pause(bool),
}

impl std::fmt::Debug for ClientPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientPayload::Start(status, reason, headers) => {
                f.debug_tuple("Start").field(status).field(reason).field(&headers.len()).finish()
            }
            ClientPayload::Body(b) => f.debug_tuple("Body").field(&b.len()).finish(),
            ClientPayload::Done(_) => f.debug_tuple("Done").finish(),
            ClientPayload::Error(e) => f.debug_tuple("Error").field(&HttpError::description(&**e)).finish(),
            ClientPayload::Pause(p) => f.debug_tuple("Pause").field(p).finish(),
        }
    }
}

/// The [`CodecObserver`] driving the response side of one client exchange.
struct ClientObserver<S: TcpStream + io::Read + io::Write> {
    conn: Rc<RefCell<TcpConnection<S>>>,
    registry: Registry,
    method: HttpMethod,
    emitter: Rc<RefCell<EventEmitter<ClientEvent, ClientPayload>>>,
    reusable: Rc<Cell<bool>>,
    response_started: Rc<Cell<bool>>,
    /// True between a 1xx `input_start` and its matching `input_end` (the
    /// codec always pairs the two, even for an interim response — see
    /// `HttpMessageHandler::handle_input`'s `!is_final` branch).
    in_nonfinal: bool,
    actions: PendingActions,
}

impl<S: TcpStream + io::Read + io::Write + mio::event::Source> CodecObserver for ClientObserver<S> {
    fn input_start(&mut self, head: &ParsedHead) -> (bool, bool) {
        self.response_started.set(true);

        let mut parts = head.top_line.splitn(3, |&b| b == b' ');
        let version = parts.next().and_then(HttpVersion::parse).unwrap_or(HttpVersion::H1_1);
        let code: u16 = parts
            .next()
            .and_then(|tok| std::str::from_utf8(tok).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let status = StatusCode(code);
        let reason: Box<str> = parts.next().map(String::from_utf8_lossy).unwrap_or_default().into_owned().into_boxed_str();

        let conn_close = head.conn_tokens.iter().any(|t| t == "close");
        let keep_alive = head.conn_tokens.iter().any(|t| t == "keep-alive");
        let reusable = !conn_close && (version == HttpVersion::H1_1 || (version == HttpVersion::H1_0 && keep_alive));
        self.reusable.set(reusable);

        let is_1xx = status.is_informational();
        self.in_nonfinal = is_1xx;
        let forbids_body = self.method == HttpMethod::Head || status.forbids_response_body() || is_1xx;

        let event = if is_1xx { ClientEvent::ResponseNonfinal } else { ClientEvent::ResponseStart };
        let emitter = self.emitter.clone();
        let headers = head.headers.clone();
        self.actions.borrow_mut().push(Box::new(move || {
            emitter.borrow_mut().emit(event, &ClientPayload::Start(status, reason, headers));
        }));

        (!forbids_body, !is_1xx)
    }

    fn input_body(&mut self, chunk: &[u8]) {
        let emitter = self.emitter.clone();
        let bytes: Box<[u8]> = chunk.into();
        self.actions.borrow_mut().push(Box::new(move || {
            emitter.borrow_mut().emit(ClientEvent::ResponseBody, &ClientPayload::Body(bytes));
        }));
    }

    fn input_end(&mut self, trailers: Headers) {
        if self.in_nonfinal {
            // Just the 1xx's own (bodyless) completion; the exchange stays
            // open for the real final response.
            self.in_nonfinal = false;
            return;
        }
        if !self.reusable.get() {
            let _ = TcpConnection::end(&self.conn, &self.registry);
        }
        let emitter = self.emitter.clone();
        self.actions.borrow_mut().push(Box::new(move || {
            emitter.borrow_mut().emit(ClientEvent::ResponseDone, &ClientPayload::Done(trailers));
        }));
    }

    fn input_error(&mut self, err: Box<dyn HttpError>, fatal: bool) {
        // Per §7: a non-fatal (tolerated, `careful=false`) error only costs
        // the connection its reuse eligibility — parsing already continued
        // past it, so the socket stays open for the rest of this response.
        self.reusable.set(false);
        if fatal {
            let _ = TcpConnection::end(&self.conn, &self.registry);
        }
        let emitter = self.emitter.clone();
        self.actions.borrow_mut().push(Box::new(move || {
            emitter.borrow_mut().emit(ClientEvent::Error, &ClientPayload::Error(err));
        }));
    }
}

/// One outbound request driven over an already-connected [`TcpConnection`].
///
/// Built by [`super::pool::HttpClient`] once a connection is attached; the
/// caller drives it through `request_start`/`request_body`/`request_done`
/// and subscribes to response events via [`HttpClientExchange::on`].
pub struct HttpClientExchange<S: TcpStream + io::Read + io::Write + mio::event::Source> {
    conn: Rc<RefCell<TcpConnection<S>>>,
    codec: Rc<RefCell<HttpMessageHandler<ClientObserver<S>>>>,
    registry: Registry,
    method: HttpMethod,
    emitter: Rc<RefCell<EventEmitter<ClientEvent, ClientPayload>>>,
    reusable: Rc<Cell<bool>>,
    response_started: Rc<Cell<bool>>,
    delimiter: Cell<Delimiter>,
}

impl<S: TcpStream + io::Read + io::Write> std::fmt::Debug for HttpClientExchange<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientExchange")
            .field("method", &self.method)
            .field("reusable", &self.reusable.get())
            .field("response_started", &self.response_started.get())
            .finish()
    }
}

impl<S: TcpStream + io::Read + io::Write + mio::event::Source + 'static> HttpClientExchange<S> {
    /// Wires a fresh exchange onto `conn`, an already-connected stream with
    /// no prior listeners attached. `idle_timeout` only affects outbound
    /// header rewriting (a zero value forces `Connection: close`); it is not
    /// otherwise interpreted here — the idle pool timer lives in
    /// [`super::pool::HttpClient`]. `careful` is forwarded straight to the
    /// codec (see `HttpClientConfig::careful`).
    pub(super) fn wire(conn: Rc<RefCell<TcpConnection<S>>>, registry: &Registry, actions: PendingActions, careful: bool) -> Self {
        let registry = registry.try_clone().expect("registry handle should always be cloneable");
        let emitter = Rc::new(RefCell::new(EventEmitter::new()));
        let reusable = Rc::new(Cell::new(true));
        let response_started = Rc::new(Cell::new(false));

        let observer = ClientObserver {
            conn: conn.clone(),
            registry: registry.try_clone().expect("registry handle should always be cloneable"),
            method: HttpMethod::Get,
            emitter: emitter.clone(),
            reusable: reusable.clone(),
            response_started: response_started.clone(),
            in_nonfinal: false,
            actions: actions.clone(),
        };
        let codec = Rc::new(RefCell::new(HttpMessageHandler::new(observer)));
        codec.borrow_mut().set_default_state_quiet(true);
        codec.borrow_mut().set_careful(careful);

        // Per §5, ownership transfer into an exchange is synchronous: the
        // previous owner (an idle pool slot, or nothing for a brand new
        // connection) must not still be listening.
        conn.borrow_mut().clear_listeners();

        {
            let codec = codec.clone();
            conn.borrow_mut().on(crate::net::connection::ConnEvent::Data, move |payload| {
                if let crate::net::connection::ConnPayload::Bytes(bytes) = payload {
                    codec.borrow_mut().handle_input(bytes);
                }
                let ready: Vec<_> = actions.borrow_mut().drain(..).collect();
                for action in ready {
                    action();
                }
            });
        }

        Self {
            conn,
            codec,
            registry,
            method: HttpMethod::Get,
            emitter,
            reusable,
            response_started,
            delimiter: Cell::new(Delimiter::None),
        }
    }

    /// Subscribes to this exchange's events, per §4.7.
    pub fn on(&mut self, event: ClientEvent, listener: impl FnMut(&ClientPayload) + 'static) {
        self.emitter.borrow_mut().on(event, listener);
    }

    /// Whether the connection may be reused for another exchange once this
    /// one finishes — known only after `response_start`/`response_done` (or
    /// unconditionally `false` after `error`).
    pub fn is_reusable(&self) -> bool {
        self.reusable.get()
    }

    /// `true` until the response head starts arriving. Per §4.7's retry
    /// policy, a clean close observed while this is still `true` is safe to
    /// retry for an idempotent method.
    pub fn awaiting_response_head(&self) -> bool {
        !self.response_started.get()
    }

    /// The method this exchange was started with (`GET` until
    /// [`HttpClientExchange::request_start`] is called).
    pub fn method(&self) -> &HttpMethod {
        &self.method
    }

    /// Writes the request line and header block, rewriting headers per
    /// §4.7: hop-by-hop names and any caller-supplied `Host` are stripped,
    /// a canonical `Host` is appended, and `Connection: close` is appended
    /// when `idle_timeout.is_zero()`. `will_stream_body` should be `true`
    /// when the caller intends to call [`HttpClientExchange::request_body`]
    /// and has not supplied its own `Content-Length`.
    pub fn request_start(
        &mut self,
        method: HttpMethod,
        uri: &Uri,
        mut headers: Headers,
        idle_timeout: std::time::Duration,
        will_stream_body: bool,
    ) -> io::Result<()> {
        self.method = method.clone();
        self.codec.borrow_mut().observer_mut().method = method.clone();
        self.codec.borrow_mut().set_default_state_quiet(false);

        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        headers.remove(b"Host");
        headers.push(b"Host".as_slice(), uri.authority().into_bytes());
        if idle_timeout.is_zero() {
            headers.push(b"Connection".as_slice(), b"close".as_slice());
        }

        let delimiter = if let Some(cl) = headers.get_first(b"Content-Length") {
            let n: usize = std::str::from_utf8(cl).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            Delimiter::Counted(n)
        } else if will_stream_body {
            headers.push(b"Transfer-Encoding".as_slice(), b"chunked".as_slice());
            Delimiter::Chunked
        } else {
            Delimiter::NoBody
        };
        self.delimiter.set(delimiter);

        let top_line = format!("{method} {} HTTP/1.1", uri.path_and_query);
        let mut codec = self.codec.borrow_mut();
        codec.output_start(top_line.as_bytes(), &headers, delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)
    }

    /// Writes one request body chunk. Valid only after
    /// [`HttpClientExchange::request_start`] selected a body-carrying
    /// delimiter.
    pub fn request_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        let delimiter = self.delimiter.get();
        let mut codec = self.codec.borrow_mut();
        codec.output_body(chunk, delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)
    }

    /// Finishes the request. Must be called exactly once, after zero or
    /// more [`HttpClientExchange::request_body`] calls.
    pub fn request_done(&mut self, trailers: Headers) -> io::Result<()> {
        let delimiter = self.delimiter.get();
        let mut codec = self.codec.borrow_mut();
        let must_close = codec.output_end(&trailers, delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)?;
        if must_close {
            TcpConnection::end(&self.conn, &self.registry)?;
        }
        Ok(())
    }

    /// Propagates backpressure to the transport: pauses or resumes reading
    /// further response bytes.
    pub fn res_body_pause(&mut self, paused: bool) -> io::Result<()> {
        self.conn.borrow_mut().pause(&self.registry, paused)
    }
}
