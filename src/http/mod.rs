//! HTTP/1.1 on top of the reactor/net layer: a shared incremental codec,
//! plus the client and server objects built on it.
//!
//! Grounded on the teacher's `parser`/`connection`/`worker` split: a
//! standalone wire-format layer (here, [`codec`]) feeding connection-level
//! request/response objects. The teacher only ever plays the server role;
//! [`client`] is new, mirroring [`server`]'s shape.

pub mod client;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod header;
pub mod server;
pub mod types;
pub mod uri;

pub use codec::{CodecObserver, Delimiter, HttpMessageHandler, ParsedHead};
pub use cursor::Cursor;
pub use error::HttpError;
pub use header::{Header, Headers, HOP_BY_HOP};
pub use types::{HttpMethod, HttpVersion, StatusCode};
pub use uri::{Origin, Uri};
