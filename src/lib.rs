// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! `evhttp` is the core of an event-driven I/O library for building
//! high-performance HTTP/1.1 intermediaries: clients, servers, and proxies.
//!
//! It is built from three tightly coupled pieces:
//!
//! * [`reactor`] — a single-threaded, readiness-based event loop over
//!   non-blocking sockets, with a sorted timer wheel and a publish/subscribe
//!   [`events`] layer.
//! * [`http::codec`] — a push-fed, incremental HTTP/1.1 parser and framer
//!   covering the full framing matrix (`Content-Length`, chunked,
//!   connection-close, bodyless responses).
//! * [`http::client`] / [`http::server`] — a per-origin pooling client
//!   connection manager and a request-serving connection handler, both built
//!   on the same codec and reactor.
//!
//! DNS resolution ([`dns`]) and TLS ([`net::tls_client`]) are kept at arm's
//! length behind small trait seams: the core drives their state machines but
//! does not implement resolution or the handshake algorithm itself.
//!
//! Everything here runs on one thread. There is no lock anywhere in the
//! core, because there is nothing else to lock against: the reactor thread
//! owns every socket, timer, pool entry, and exchange it touches. See
//! [`reactor::Reactor`] for the one external threading boundary (DNS lookups
//! hopping back onto the reactor thread through a [`mio::Waker`]).

pub mod dns;
pub mod events;
pub mod http;
pub mod net;
pub mod reactor;
