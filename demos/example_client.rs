//! A minimal `evhttp` client: issues one GET through a pooled connection and
//! prints the response status and body once it arrives.
//!
//! Run with `cargo run --example example_client` against a server listening
//! on `127.0.0.1:8080` (e.g. `example_server`).

use evhttp::dns::ThreadResolver;
use evhttp::http::client::{ClientEvent, ClientPayload, HttpClient, HttpClientConfig};
use evhttp::http::header::Headers;
use evhttp::http::types::HttpMethod;
use evhttp::http::uri::Uri;
use evhttp::reactor::Reactor;

fn main() -> std::io::Result<()> {
    let mut reactor = Reactor::new()?;
    let client = HttpClient::<mio::net::TcpStream, ThreadResolver>::new(&mut reactor, HttpClientConfig::default())?;
    let uri = Uri::parse("http://127.0.0.1:8080/weather/forecast").expect("fixed demo URI should always parse");

    client.borrow().request(
        &mut reactor,
        HttpMethod::Get,
        uri,
        Headers::new(),
        None,
        |exchange| {
            exchange.on(ClientEvent::ResponseStart, |payload| {
                if let ClientPayload::Start(status, reason, _) = payload {
                    println!("{status} {reason}");
                }
            });
            exchange.on(ClientEvent::ResponseBody, |payload| {
                if let ClientPayload::Body(chunk) = payload {
                    print!("{}", String::from_utf8_lossy(chunk));
                }
            });
        },
        |err| eprintln!("request failed: {err}"),
    );

    reactor.run()
}
