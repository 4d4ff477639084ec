//! HTTP method, version, and status types.
//!
//! Grounded on the teacher's `parser::{HttpMethod, HttpVersion}` and
//! `parser::status::Status` (originally three separate files,
//! `parser/method.rs`, `parser/version.rs`, `parser/status.rs`); consolidated
//! here since the codec, client, and server all need all three and the
//! teacher's own split was never load-bearing (no module kept its sibling at
//! arm's length for any reason besides file size).

use std::fmt;

/// The request method, per
/// [RFC 9110 §9](https://www.rfc-editor.org/rfc/rfc9110#section-9).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// §9.3.1
    Get,
    /// §9.3.2
    Head,
    /// §9.3.3
    Post,
    /// §9.3.4
    Put,
    /// §9.3.5
    Delete,
    /// §9.3.6
    Connect,
    /// §9.3.7
    Options,
    /// §9.3.8
    Trace,
    /// §9.3 doesn't enumerate `PATCH`, but RFC 5789 registers it and callers
    /// issue it routinely; kept alongside the original eight as `Extension`
    /// rather than silently rejecting it.
    Extension(Box<str>),
}

impl HttpMethod {
    /// Whether this method is in the idempotent set eligible for automatic
    /// retry after a connection-level failure, per §4.7's retry policy.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            HttpMethod::Get
                | HttpMethod::Head
                | HttpMethod::Put
                | HttpMethod::Delete
                | HttpMethod::Options
                | HttpMethod::Trace
        )
    }

    /// Parses a method token, case-sensitively per RFC 9110 (methods are
    /// case-sensitive tokens; `get` is not `GET`).
    pub fn parse(token: &[u8]) -> Option<Self> {
        Some(match token {
            b"GET" => HttpMethod::Get,
            b"HEAD" => HttpMethod::Head,
            b"POST" => HttpMethod::Post,
            b"PUT" => HttpMethod::Put,
            b"DELETE" => HttpMethod::Delete,
            b"CONNECT" => HttpMethod::Connect,
            b"OPTIONS" => HttpMethod::Options,
            b"TRACE" => HttpMethod::Trace,
            other => {
                if other.is_empty() || !other.iter().all(|&b| is_token_char(b)) {
                    return None;
                }
                HttpMethod::Extension(String::from_utf8_lossy(other).into_owned().into_boxed_str())
            }
        })
    }
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Extension(s) => s,
        })
    }
}

/// The message's declared HTTP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl HttpVersion {
    /// Parses a version token of the exact shape `HTTP/1.x`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"HTTP/1.0" => Some(HttpVersion::H1_0),
            b"HTTP/1.1" => Some(HttpVersion::H1_1),
            _ => None,
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// A response status code, carried as the raw number plus reason phrase
/// bytes exactly as received (or supplied) — unlike the teacher's
/// server-only `#[repr(u16)] enum Status`, a client must be able to
/// represent *any* three-digit code a peer sends, including ones this crate
/// doesn't name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// §15.2 — informational.
    pub const CONTINUE: StatusCode = StatusCode(100);
    /// §15.3.1
    pub const OK: StatusCode = StatusCode(200);
    /// §15.3.5
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    /// §15.4.5
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    /// §15.5.1
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// §15.5.5
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// §15.5.12 — used by `LengthRequiredError`.
    pub const LENGTH_REQUIRED: StatusCode = StatusCode(411);
    /// §15.6.1
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    /// §15.6.2 — used when a server rejects an unsupported transfer coding.
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    /// §15.2 informational range.
    pub fn is_informational(self) -> bool {
        (100..200).contains(&self.0)
    }

    /// True for exactly the two statuses §4.7 calls out as always bodyless
    /// on a client response regardless of headers: 204 and 304.
    pub fn forbids_response_body(self) -> bool {
        self == StatusCode::NO_CONTENT || self == StatusCode::NOT_MODIFIED
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
