//! The HTTP client side: a connection pool keyed by origin, each connection
//! driven by the same shared codec the server side uses, read the other way
//! around.
//!
//! Grounded on [`super::server`]'s shape, with [`super::super::net::tcp_client::TcpClient`]
//! and [`super::super::dns`] standing in for [`super::super::net::tcp_server::TcpServer`]'s
//! accept loop on the connect side.

pub mod exchange;
pub mod pool;

pub use exchange::{ClientEvent, ClientPayload, HttpClientExchange};
pub use pool::{HttpClient, HttpClientConfig};

use std::cell::RefCell;
use std::rc::Rc;

/// Work queued by [`exchange::ClientObserver`] (response events) or
/// [`pool::HttpClient`] (retry/connect-error dispatch) while running inside
/// a borrow that must be released before the application can be called back
/// into — the same reentrancy hazard and fix as
/// [`super::server::PendingActions`], applied to the client side.
pub(super) type PendingActions = Rc<RefCell<Vec<Box<dyn FnOnce()>>>>;
