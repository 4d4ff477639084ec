//! The per-request object handed to application code once a request's head
//! is fully parsed.
//!
//! Grounded on the teacher's `worker.rs`, which builds a
//! `Response::new_with_status_line` per completed parse and hands it back
//! through the connection's `prepare_response`/`responses` queue
//! (`connection.rs`). `HttpServerExchange` generalizes that one-shot
//! response object into something the application can stream a body
//! into incrementally, matching §4.9's "construct an `HttpServerExchange`
//! per completed request head" contract.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use mio::Registry;

use crate::net::connection::TcpConnection;
use crate::net::tcp_stream::TcpStream;

use super::super::codec::{Delimiter, HttpMessageHandler};
use super::super::error::HttpError;
use super::super::header::Headers;
use super::super::types::{HttpMethod, HttpVersion, StatusCode};
use super::ServerObserver;

/// One in-flight request/response pair on a server connection.
///
/// Cheap to clone (it's a handle onto the shared connection state); the
/// application is expected to hold onto one until it has called
/// [`HttpServerExchange::respond`] (or an error ends the exchange first).
pub struct HttpServerExchange<S: TcpStream + io::Read + io::Write + mio::event::Source> {
    pub(super) conn: Rc<RefCell<TcpConnection<S>>>,
    pub(super) codec: Rc<RefCell<HttpMessageHandler<ServerObserver<S>>>>,
    pub(super) registry: Registry,
    pub(super) method: HttpMethod,
    pub(super) target: Box<str>,
    pub(super) version: HttpVersion,
    pub(super) request_headers: Headers,
    pub(super) responded: bool,
}

impl<S: TcpStream + io::Read + io::Write> std::fmt::Debug for HttpServerExchange<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerExchange")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("responded", &self.responded)
            .finish()
    }
}

impl<S: TcpStream + io::Read + io::Write + mio::event::Source + 'static> HttpServerExchange<S> {
    /// The request method.
    pub fn method(&self) -> &HttpMethod {
        &self.method
    }

    /// The request target exactly as received (origin-form path, or
    /// absolute-form/authority-form for a proxy request) — unparsed, since
    /// §4.9 doesn't ask the server side to resolve it into a [`super::super::uri::Uri`]
    /// the way an outbound client request does.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The declared HTTP version of the request.
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// Headers received with the request.
    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    /// Writes a complete response in one call: status line, headers, and a
    /// body whose full length is already known. Framed `Counted`, except
    /// for `HEAD` requests and the statuses that forbid a response body
    /// (204, 304), which are always `NoBody` regardless of what `body`
    /// contains.
    pub fn respond(&mut self, status: StatusCode, reason: &str, headers: Headers, body: &[u8]) -> io::Result<()> {
        let forbids_body = self.method == HttpMethod::Head || status.forbids_response_body();
        let delimiter = if forbids_body {
            Delimiter::NoBody
        } else {
            Delimiter::Counted(body.len())
        };
        let body = if forbids_body { &[][..] } else { body };
        self.write_head(status, reason, headers, delimiter)?;
        self.write_body(delimiter, body)?;
        self.end_body(delimiter)
    }

    /// Starts a response whose body length isn't known up front. Per
    /// §4.9's server-side delimiter table: `Chunked` framing on an
    /// HTTP/1.1 request, `Close` framing (body runs until the connection
    /// closes) on HTTP/1.0. Follow with [`HttpServerExchange::write_body`]
    /// any number of times, then [`HttpServerExchange::end_body`].
    pub fn respond_streaming(&mut self, status: StatusCode, reason: &str, headers: Headers) -> io::Result<Delimiter> {
        let delimiter = match self.version {
            HttpVersion::H1_1 => Delimiter::Chunked,
            HttpVersion::H1_0 => Delimiter::Close,
        };
        self.write_head(status, reason, headers, delimiter)?;
        Ok(delimiter)
    }

    fn write_head(&mut self, status: StatusCode, reason: &str, mut headers: Headers, delimiter: Delimiter) -> io::Result<()> {
        if self.responded {
            return Ok(());
        }
        self.responded = true;

        if let Delimiter::Counted(n) = delimiter {
            if headers.get_first(b"Content-Length").is_none() {
                headers.push(b"Content-Length".as_slice(), n.to_string().into_bytes());
            }
        }
        if delimiter == Delimiter::Chunked && headers.get_first(b"Transfer-Encoding").is_none() {
            headers.push(b"Transfer-Encoding".as_slice(), b"chunked".as_slice());
        }

        let top_line = format!("{} {} {}", self.version, status, reason);
        let mut codec = self.codec.borrow_mut();
        codec.output_start(top_line.as_bytes(), &headers, delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)
    }

    /// Writes one body chunk of a streaming response started with
    /// [`HttpServerExchange::respond_streaming`].
    pub fn write_body(&mut self, delimiter: Delimiter, chunk: &[u8]) -> io::Result<()> {
        let mut codec = self.codec.borrow_mut();
        codec.output_body(chunk, delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)
    }

    /// Finishes a streaming response. `Close`-delimited responses end by
    /// closing the connection once queued bytes drain; others just stop.
    pub fn end_body(&mut self, delimiter: Delimiter) -> io::Result<()> {
        let mut codec = self.codec.borrow_mut();
        let must_close = codec.output_end(&Headers::new(), delimiter);
        let out = codec.take_output();
        drop(codec);
        TcpConnection::write(&self.conn, &self.registry, out)?;
        if must_close {
            TcpConnection::end(&self.conn, &self.registry)?;
        }
        Ok(())
    }

    /// Convenience for an error response carrying a plain-text body built
    /// from an [`HttpError`]'s detail.
    pub fn respond_error(&mut self, status: StatusCode, err: &dyn HttpError) -> io::Result<()> {
        let mut headers = Headers::new();
        headers.push(b"Content-Type".as_slice(), b"text/plain; charset=utf-8".as_slice());
        self.respond(status, reason_phrase(status), headers, err.detail().as_bytes())
    }
}

/// A minimal reason-phrase table for the statuses this crate names; any
/// other code is sent with an empty phrase, which RFC 9112 §4 explicitly
/// permits ("a client... SHOULD ignore the reason-phrase content").
pub fn reason_phrase(status: StatusCode) -> &'static str {
    match status.0 {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        411 => "Length Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}
