//! TLS-wrapped outbound connect: identical external contract to
//! [`super::tcp_client::TcpClient`], with a non-blocking handshake spliced
//! in between the TCP connect and the `connect` event.
//!
//! The teacher only ever terminates TLS (`TlsConnection` in `connection.rs`
//! wraps `rustls::ServerConnection` behind an `Arc<ServerConfig>` the caller
//! supplies to `ConnectionBuilder::with_tls`). This repurposes that same
//! caller-supplies-its-own-config shape for the client side:
//! `rustls::ClientConnection` plus a caller-supplied `Arc<ClientConfig>`.
//! Per spec §6, the core does not ship a trust-anchored default verifier;
//! [`danger_accept_any_cert`] exists only as an explicit, separately-named
//! opt-in for tests and development.
//!
//! The handshake driver keeps its own [`EventSource`], independent of the
//! one `TcpClient` uses for the TCP phase, because listeners registered
//! through [`crate::reactor::Reactor::on_any_io`] only ever see `(Token,
//! IoEvent)`, never `&mut Reactor` — rearming interest between handshake
//! steps goes through a registry handle captured once, up front, instead of
//! reaching back into the reactor's own source table.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mio::{Registry, Token};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

use crate::events::EventEmitter;
use crate::reactor::{EventSource, IoEvent, Reactor};

use super::connection::TcpConnection;
use super::tcp_client::{ConnectErrorKind, TcpClient, TcpClientEvent, TcpClientPayload};
use super::tcp_stream::TcpStream;

/// Events [`connect`] emits, mirroring [`TcpClientEvent`] 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsEvent {
    /// The handshake completed; carries the handshake-wrapped connection.
    Connect,
    /// TCP connect or handshake failed.
    ConnectError,
}

/// Payload for a [`TlsEvent`]. Mirrors [`TcpClientPayload`]'s `RefCell`
/// handoff: `once` listeners only see `&TlsPayload`, so the connection
/// moves over through interior mutability rather than by value.
pub enum TlsPayload<S: TcpStream + Read + Write> {
    /// The established, handshake-complete connection.
    Connected(RefCell<Option<TcpConnection<S>>>),
    /// `(kind, code, message)`.
    Failed(ConnectErrorKind, i32, String),
}

impl<S: TcpStream + Read + Write> std::fmt::Debug for TlsPayload<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsPayload::Connected(_) => f.debug_tuple("Connected").finish(),
            TlsPayload::Failed(kind, code, msg) => f.debug_tuple("Failed").field(kind).field(code).field(msg).finish(),
        }
    }
}

/// Holds the eventual outcome of a [`connect`] call.
pub struct TlsOutcome<S: TcpStream + Read + Write> {
    emitter: EventEmitter<TlsEvent, TlsPayload<S>>,
    fired: bool,
}

impl<S: TcpStream + Read + Write> std::fmt::Debug for TlsOutcome<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOutcome").field("fired", &self.fired).finish()
    }
}

impl<S: TcpStream + Read + Write> TlsOutcome<S> {
    /// Subscribes to the handshake outcome.
    pub fn on(&mut self, event: TlsEvent, listener: impl FnMut(&TlsPayload<S>) + 'static) {
        self.emitter.once(event, listener);
    }

    fn fire(&mut self, event: TlsEvent, payload: TlsPayload<S>) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.emitter.emit(event, &payload);
    }
}

struct HandshakeState<S: TcpStream + Read + Write + mio::event::Source> {
    token: Token,
    stream: S,
    tls: ClientConnection,
    peer_addr: SocketAddr,
    source: EventSource,
    registry: Registry,
}

type Handshake<S> = Rc<RefCell<Option<HandshakeState<S>>>>;

/// Begins a TLS connect: TCP connect, then a non-blocking `rustls` client
/// handshake, then the same `connect`/`connect_error` outcome contract as
/// [`TcpClient::connect`].
pub fn connect<S>(
    reactor: &mut Reactor,
    addr: SocketAddr,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    timeout: Option<Duration>,
    ip_check: Option<&dyn Fn(IpAddr) -> bool>,
) -> io::Result<Rc<RefCell<TlsOutcome<S>>>>
where
    S: TcpStream + Read + Write + mio::event::Source + 'static,
{
    let outcome = Rc::new(RefCell::new(TlsOutcome {
        emitter: EventEmitter::new(),
        fired: false,
    }));
    let handshake: Handshake<S> = Rc::new(RefCell::new(None));
    let registry = reactor.registry().try_clone()?;

    let dispatch_outcome = outcome.clone();
    let dispatch_handshake = handshake.clone();
    reactor.on_any_io(move |token, _event| {
        let matches = matches!(dispatch_handshake.borrow().as_ref(), Some(hs) if hs.token == token);
        if matches {
            step(&dispatch_handshake, &dispatch_outcome);
        }
    });

    let tcp_client = TcpClient::<S>::connect(reactor, addr, timeout, ip_check)?;

    let connect_outcome = outcome.clone();
    let connect_handshake = handshake.clone();
    tcp_client.borrow_mut().on(TcpClientEvent::Connect, move |payload| {
        let TcpClientPayload::Connected(cell) = payload else {
            unreachable!("Connect always carries TcpClientPayload::Connected")
        };
        let Some(conn) = cell.borrow_mut().take() else { return };
        let (token, stream, peer_addr) = conn.into_parts();

        let tls = match ClientConnection::new(config.clone(), server_name.clone()) {
            Ok(tls) => tls,
            Err(e) => {
                connect_outcome.borrow_mut().fire(
                    TlsEvent::ConnectError,
                    TlsPayload::Failed(ConnectErrorKind::Ssl, 0, e.to_string()),
                );
                return;
            }
        };
        let Ok(registry) = registry.try_clone() else { return };

        *connect_handshake.borrow_mut() = Some(HandshakeState {
            token,
            stream,
            tls,
            peer_addr,
            source: EventSource::new(token),
            registry,
        });
        step(&connect_handshake, &connect_outcome);
    });

    let error_outcome = outcome.clone();
    tcp_client.borrow_mut().on(TcpClientEvent::ConnectError, move |payload| {
        let TcpClientPayload::Failed(kind, code, msg) = payload else {
            unreachable!("ConnectError always carries TcpClientPayload::Failed")
        };
        error_outcome
            .borrow_mut()
            .fire(TlsEvent::ConnectError, TlsPayload::Failed(*kind, *code, msg.clone()));
    });

    Ok(outcome)
}

/// Runs the handshake state machine until it would block, completes, or
/// fails, driven purely by `rustls`'s `wants_read`/`wants_write` (the
/// `SSL_WANT_READ`/`SSL_WANT_WRITE` spec §4.5 refers to).
fn step<S>(handshake: &Handshake<S>, outcome: &Rc<RefCell<TlsOutcome<S>>>)
where
    S: TcpStream + Read + Write + mio::event::Source,
{
    let step_result = {
        let mut guard = handshake.borrow_mut();
        let hs = guard.as_mut().expect("step is only called while a handshake is in flight");
        run_io(hs)
    };

    match step_result {
        StepResult::Pending => {
            let mut guard = handshake.borrow_mut();
            let hs = guard.as_mut().unwrap();
            if hs.tls.wants_read() {
                hs.source.event_add(IoEvent::Readable);
            } else {
                hs.source.event_del(IoEvent::Readable);
            }
            if hs.tls.wants_write() {
                hs.source.event_add(IoEvent::Writable);
            } else {
                hs.source.event_del(IoEvent::Writable);
            }
            let _ = hs.source.sync(&hs.registry, &mut hs.stream);
        }
        StepResult::Done => {
            let HandshakeState {
                token,
                mut stream,
                peer_addr,
                mut source,
                registry,
                ..
            } = handshake.borrow_mut().take().unwrap();
            let _ = source.close(&registry, &mut stream);
            let conn = TcpConnection::new(token, stream, peer_addr);
            outcome
                .borrow_mut()
                .fire(TlsEvent::Connect, TlsPayload::Connected(RefCell::new(Some(conn))));
        }
        StepResult::Failed(err) => {
            let HandshakeState {
                mut stream,
                mut source,
                registry,
                ..
            } = handshake.borrow_mut().take().unwrap();
            let code = err.raw_os_error().unwrap_or(0);
            let _ = source.close(&registry, &mut stream);
            outcome.borrow_mut().fire(
                TlsEvent::ConnectError,
                TlsPayload::Failed(ConnectErrorKind::Ssl, code, err.to_string()),
            );
        }
    }
}

enum StepResult {
    Pending,
    Done,
    Failed(io::Error),
}

fn run_io<S>(hs: &mut HandshakeState<S>) -> StepResult
where
    S: TcpStream + Read + Write + mio::event::Source,
{
    loop {
        if !hs.tls.is_handshaking() {
            return StepResult::Done;
        }
        if hs.tls.wants_write() {
            match hs.tls.write_tls(&mut hs.stream) {
                Ok(0) => return StepResult::Pending,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return StepResult::Pending,
                Err(e) => return StepResult::Failed(e),
            }
        } else if hs.tls.wants_read() {
            match hs.tls.read_tls(&mut hs.stream) {
                Ok(0) => {
                    return StepResult::Failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ))
                }
                Ok(_) => {
                    if let Err(e) = hs.tls.process_new_packets() {
                        return StepResult::Failed(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return StepResult::Pending,
                Err(e) => return StepResult::Failed(e),
            }
        } else {
            return StepResult::Pending;
        }
    }
}

/// A permissive, no-verification `rustls` verifier for tests and local
/// development. Per spec §6, the core ships no trust-anchored default; this
/// is the explicit, separately-named opt-in instead of a silent fallback.
pub fn danger_accept_any_cert() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCert))
            .with_no_client_auth(),
    )
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
