//! Binds a file descriptor to an [`EventEmitter`], with a per-fd interest set.
//!
//! Grounded on the teacher's direct `register`/`reregister`/`deregister`
//! calls against `mio::Registry` scattered through `PlainConnection` and
//! `TlsConnection` (`connection.rs`); pulled out here into its own type so
//! every socket owner (connection, client, server, listener) shares one
//! piece of bookkeeping instead of recomputing an `Interest` mask inline.

use std::fmt;
use std::io;

use mio::{Interest, Registry, Token};

use crate::events::EventEmitter;

/// The event names an [`EventSource`] can emit, drawn 1:1 from spec §4.2's
/// `{readable, writable, error, close}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// The fd became readable.
    Readable,
    /// The fd became writable.
    Writable,
    /// The fd reported an error (`SO_ERROR` or equivalent).
    Error,
    /// The peer closed its half (or both halves) of the connection.
    Close,
}

/// Per-fd interest bitset plus the emitter consumers subscribe to.
///
/// `mio::Interest` cannot represent "no interest" (it's a non-empty bitflag
/// by construction), so an `EventSource` with neither readable nor writable
/// interest armed is fully deregistered from the kernel readiness backend
/// rather than registered with an empty mask. [`EventSource::sync`] is the
/// single entry point that reconciles the logical interest set against the
/// physical registration, so `pause(true)` (drop readable interest) results
/// in the fd falling out of epoll/kqueue entirely when nothing else is
/// armed, matching spec §4.4's "while paused, `data` is not emitted".
pub struct EventSource {
    token: Token,
    readable: bool,
    writable: bool,
    registered: bool,
    pub(crate) emitter: EventEmitter<IoEvent, ()>,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("registered", &self.registered)
            .finish()
    }
}

impl EventSource {
    /// Creates a new source for `token` with no interest registered yet.
    pub fn new(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            registered: false,
            emitter: EventEmitter::new(),
        }
    }

    /// The token this source was registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Adds `event` to the interest set. Does not touch the kernel
    /// registration; call [`EventSource::sync`] afterwards.
    pub fn event_add(&mut self, event: IoEvent) {
        match event {
            IoEvent::Readable => self.readable = true,
            IoEvent::Writable => self.writable = true,
            IoEvent::Error | IoEvent::Close => {}
        }
    }

    /// Removes `event` from the interest set. Does not touch the kernel
    /// registration; call [`EventSource::sync`] afterwards.
    pub fn event_del(&mut self, event: IoEvent) {
        match event {
            IoEvent::Readable => self.readable = false,
            IoEvent::Writable => self.writable = false,
            IoEvent::Error | IoEvent::Close => {}
        }
    }

    /// Whether readable interest is currently armed.
    pub fn is_readable_armed(&self) -> bool {
        self.readable
    }

    /// Whether writable interest is currently armed.
    pub fn is_writable_armed(&self) -> bool {
        self.writable
    }

    fn interest(&self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Reconciles the logical interest set against the kernel registration:
    /// registers if newly interested, reregisters if the mask changed,
    /// deregisters if interest dropped to nothing. Idempotent.
    pub fn sync(&mut self, registry: &Registry, source: &mut dyn mio::event::Source) -> io::Result<()> {
        match (self.interest(), self.registered) {
            (Some(interest), false) => {
                registry.register(source, self.token, interest)?;
                self.registered = true;
            }
            (Some(interest), true) => {
                registry.reregister(source, self.token, interest)?;
            }
            (None, true) => {
                registry.deregister(source)?;
                self.registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Full teardown: clears every interest bit and listener and removes
    /// the kernel registration if one exists. Used when a connection closes
    /// for good, as opposed to `pause(true)` which is meant to be reversible.
    pub fn close(&mut self, registry: &Registry, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.readable = false;
        self.writable = false;
        self.emitter.remove_listeners(None);
        if self.registered {
            self.registered = false;
            return registry.deregister(source);
        }
        Ok(())
    }
}
