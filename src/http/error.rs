//! The HTTP codec's error taxonomy.
//!
//! Grounded on the teacher's `parser::error` module, which carries one
//! struct per failure variety rather than a single enum, each pairing a
//! human description with an HTTP status the server side should answer
//! with. Generalized to cover the full set named spec.md §7 (the teacher's
//! parser predates several of these — `DnsError`/`ConnectError` in
//! particular are client-side failures the teacher, being server-only,
//! never needed) and to add the `server_recoverable`/`client_recoverable`
//! flags §7 requires: whether the connection the error occurred on can be
//! reused afterward, from the server's and the client's point of view
//! respectively.

use std::fmt;

use super::types::StatusCode;

/// Marker for an error whose connection cannot safely be reused, on either
/// side, once it has occurred — e.g. malformed framing leaves the peer's
/// read position unrecoverable.
macro_rules! http_error {
    (
        $(#[$meta:meta])*
        $name:ident {
            status: $status:expr,
            server_recoverable: $sr:expr,
            client_recoverable: $cr:expr,
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            /// What went wrong, suitable for logging or a response body.
            pub detail: String,
        }

        impl $name {
            /// Builds the error with a caller-supplied detail message.
            pub fn new(detail: impl Into<String>) -> Self {
                Self { detail: detail.into() }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}: {}", stringify!($name), self.detail)
            }
        }

        impl std::error::Error for $name {}

        impl HttpError for $name {
            fn description(&self) -> &str {
                stringify!($name)
            }

            fn detail(&self) -> &str {
                &self.detail
            }

            fn server_status(&self) -> Option<StatusCode> {
                $status
            }

            fn server_recoverable(&self) -> bool {
                $sr
            }

            fn client_recoverable(&self) -> bool {
                $cr
            }
        }
    };
}

/// Common surface every concrete error type implements, so the codec can
/// report a uniform shape to its [`super::codec::CodecObserver`] regardless
/// of which concrete error occurred.
pub trait HttpError: fmt::Display + std::error::Error {
    /// Short, stable name for the failure variety (used in logs and in
    /// matching against the teacher's own error-naming convention).
    fn description(&self) -> &str;

    /// The specific condition that triggered this error.
    fn detail(&self) -> &str;

    /// The status a server should answer with, if this error occurred
    /// while parsing a request the server can still respond to. `None` for
    /// errors that only make sense client-side (`DnsError`, `ConnectError`).
    fn server_status(&self) -> Option<StatusCode>;

    /// Whether a server that hit this error while reading one request can
    /// still read further requests on the same connection.
    fn server_recoverable(&self) -> bool;

    /// Whether a client that hit this error while reading one response can
    /// still read further responses on the same connection.
    fn client_recoverable(&self) -> bool;
}

http_error!(
    /// A chunked body's chunk-size line or trailing CRLF was malformed
    /// (§4.6.4's off-by-one CRLF edge case lands here).
    ChunkError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// More than one `Content-Length` header was present with differing
    /// values.
    DuplicateCLError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: true,
    }
);

http_error!(
    /// A `Content-Length` header's value was not a valid non-negative
    /// decimal integer.
    MalformedCLError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// Bytes followed a message whose framing said it was already
    /// complete (e.g. data after a `Content-Length`-delimited body, on a
    /// connection that isn't being reused for pipelining).
    ExtraDataError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// The request/status line itself did not parse (wrong number of
    /// fields, missing method, unparseable status code).
    StartLineError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// The version token in a start line was not `HTTP/1.0` or `HTTP/1.1`.
    HttpVersionError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// No further bytes arrived before the configured read timeout while a
    /// message was partially received.
    ReadTimeoutError {
        status: None,
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// `Transfer-Encoding` named a coding other than `chunked`, or named
    /// `chunked` somewhere other than last.
    TransferCodeError {
        status: Some(StatusCode::NOT_IMPLEMENTED),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// Whitespace appeared between a header field name and its colon,
    /// which §4.6.3 treats as a smuggling risk rather than tolerating it.
    HeaderSpaceError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: true,
    }
);

http_error!(
    /// Whitespace appeared between the request method/target or the
    /// status line's fields in a way the start-line grammar forbids.
    TopLineSpaceError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: true,
    }
);

http_error!(
    /// More messages arrived on one connection than the configured
    /// pipelining limit allows.
    TooManyMsgsError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: false,
        client_recoverable: false,
    }
);

http_error!(
    /// The request target or a header value that must be a URI did not
    /// parse as one.
    UrlError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: true,
        client_recoverable: false,
    }
);

http_error!(
    /// A request method that requires a declared body length (no
    /// `Content-Length` and no `Transfer-Encoding`) had neither.
    LengthRequiredError {
        status: Some(StatusCode::LENGTH_REQUIRED),
        server_recoverable: true,
        client_recoverable: true,
    }
);

http_error!(
    /// Name resolution failed before a connection attempt could be made.
    /// Client-only; no server status applies.
    DnsError {
        status: None,
        server_recoverable: false,
        client_recoverable: true,
    }
);

http_error!(
    /// The TCP (or TLS) connection attempt itself failed. Client-only.
    ConnectError {
        status: None,
        server_recoverable: false,
        client_recoverable: true,
    }
);

http_error!(
    /// The request targeted a resource the server declines to serve for
    /// policy reasons unrelated to framing (kept distinct from
    /// `StartLineError` so access-control failures don't read as parse
    /// bugs in logs).
    AccessError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: true,
        client_recoverable: false,
    }
);

http_error!(
    /// An HTTP/1.1 request omitted the mandatory `Host` header.
    HostRequiredError {
        status: Some(StatusCode::BAD_REQUEST),
        server_recoverable: true,
        client_recoverable: false,
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_content_length_is_server_unrecoverable_but_client_recoverable() {
        let e = DuplicateCLError::new("Content-Length: 4, Content-Length: 5");
        assert_eq!(e.server_status(), Some(StatusCode::BAD_REQUEST));
        assert!(!e.server_recoverable());
        assert!(e.client_recoverable());
        assert_eq!(e.detail(), "Content-Length: 4, Content-Length: 5");
    }

    #[test]
    fn dns_error_has_no_server_status() {
        let e = DnsError::new("no such host");
        assert_eq!(e.server_status(), None);
        assert!(e.client_recoverable());
    }

    #[test]
    fn host_required_is_server_recoverable() {
        let e = HostRequiredError::new("missing Host header on HTTP/1.1 request");
        assert!(e.server_recoverable());
        assert_eq!(e.server_status(), Some(StatusCode::BAD_REQUEST));
    }
}
