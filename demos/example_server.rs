//! A minimal `evhttp` server: binds one listener and answers every request
//! with a canned 200, echoing the request target back in the body.
//!
//! Run with `cargo run --example example_server` (once wired into
//! `Cargo.toml`'s `[[example]]` table) and hit it with `curl localhost:8080/`.

use std::time::Duration;

use evhttp::http::header::Headers;
use evhttp::http::server::HttpServer;
use evhttp::reactor::Reactor;

fn main() -> std::io::Result<()> {
    let mut reactor = Reactor::new()?;
    let listener = mio::net::TcpListener::bind("127.0.0.1:8080".parse().unwrap())?;

    let _server = HttpServer::bind(&mut reactor, listener, Duration::from_secs(15), |mut exchange| {
        let body = format!("hello, {}\n", exchange.target());
        let mut headers = Headers::new();
        headers.push(b"Content-Type".as_slice(), b"text/plain; charset=utf-8".as_slice());
        let _ = exchange.respond(evhttp::http::types::StatusCode::OK, "OK", headers, body.as_bytes());
    })?;

    reactor.run()
}
