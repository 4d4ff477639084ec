//! Non-blocking TCP transport: connections, clients, servers, and TLS.

pub mod connection;
pub mod tcp_client;
pub mod tcp_listener;
pub mod tcp_server;
pub mod tcp_stream;
pub mod tls_client;

pub use connection::{ConnEvent, TcpConnection};
pub use tcp_client::{ConnectErrorKind, TcpClient};
pub use tcp_server::TcpServer;
