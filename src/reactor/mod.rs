//! The event loop: readiness-based I/O dispatch plus a sorted timer wheel.
//!
//! Grounded on the teacher's `Listener::run`/`MultiListener::run` (a
//! `mio::Poll` + `mio::Events` loop keyed by a `slab::Slab` of connections,
//! with a dedicated waker token reserved at the top of the token space).
//! Generalized here to: own arbitrary [`EventSource`]s rather than only
//! accepted connections, carry the timer list the teacher has none of, and
//! expose an explicit, application-constructed handle instead of a
//! process-wide default loop (per the "Process-wide default loop" design
//! note this crate implements — no hidden global state).
//!
//! The reactor is single-threaded and cooperative: one thread owns it and
//! every [`EventSource`] registered with it. There is no lock. Calling any
//! mutating method from a thread other than the one driving [`Reactor::run`]
//! is undefined behavior; the only sanctioned cross-thread interaction is
//! posting a closure through [`Reactor::mailbox`], which is how DNS lookups
//! (run on a separate thread pool, see [`crate::dns`]) hop back onto the
//! reactor thread before touching any core data structure.

mod source;
mod timer;

pub use source::{EventSource, IoEvent};
pub use timer::CancelHandle;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use slab::Slab;

use crate::events::EventEmitter;
use timer::{insert_sorted, TimerEntry};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default readiness-poll / timer-sweep interval, per spec §4.2 ("0.1-0.5s").
pub const DEFAULT_PRECISION: Duration = Duration::from_millis(200);

/// Lifecycle events emitted by the reactor itself (as opposed to events
/// emitted by individual [`EventSource`]s it owns).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorEvent {
    /// `run()` has started polling.
    Start,
    /// `stop()` has torn everything down.
    Stop,
}

type Mailbox = Arc<Mutex<VecDeque<Box<dyn FnOnce(&mut Reactor) + Send>>>>;

/// The event loop.
///
/// Construct one explicitly per thread that needs it — there is
/// intentionally no `Reactor::global()`. Timer callbacks that need to
/// affect the reactor itself (schedule more timers, call `stop()`) should
/// capture an `Rc<RefCell<Reactor>>` the application holds, since
/// `Reactor::run` takes `&mut self` for the duration of the loop.
pub struct Reactor {
    poll: Poll,
    sources: Slab<EventSource>,
    timers: Vec<TimerEntry>,
    running: bool,
    precision: Duration,
    last_timer_pass: Instant,
    emitter: EventEmitter<ReactorEvent, ()>,
    waker: Arc<Waker>,
    mailbox: Mailbox,
    any_io: Vec<Box<dyn FnMut(Token, IoEvent)>>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.sources.len())
            .field("timers", &self.timers.len())
            .field("running", &self.running)
            .field("precision", &self.precision)
            .finish()
    }
}

/// A `Send` handle that can wake a [`Reactor`] and hand it a closure to run
/// on its own thread. This is the "internal mailbox" spec §5 requires for
/// DNS lookups (run off-thread) to safely touch core data structures.
#[derive(Clone)]
pub struct MailboxSender {
    mailbox: Mailbox,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for MailboxSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSender").finish()
    }
}

impl MailboxSender {
    /// Queues `job` to run on the reactor thread and wakes the reactor so it
    /// runs promptly rather than waiting out the next poll timeout.
    pub fn post(&self, job: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.mailbox.lock().unwrap().push_back(Box::new(job));
        let _ = self.waker.wake();
    }
}

impl Reactor {
    /// Creates a reactor with the default precision.
    pub fn new() -> io::Result<Self> {
        Self::with_precision(DEFAULT_PRECISION)
    }

    /// Creates a reactor with an explicit poll/timer-sweep precision.
    pub fn with_precision(precision: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            sources: Slab::new(),
            timers: Vec::new(),
            running: false,
            precision,
            last_timer_pass: Instant::now(),
            emitter: EventEmitter::new(),
            waker,
            mailbox: Arc::new(Mutex::new(VecDeque::new())),
            any_io: Vec::new(),
        })
    }

    /// A cloneable, `Send` handle other threads (DNS workers) can use to
    /// post work back onto this reactor's thread.
    pub fn mailbox(&self) -> MailboxSender {
        MailboxSender {
            mailbox: self.mailbox.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Subscribes to reactor lifecycle events (`start`, `stop`).
    pub fn on(&mut self, event: ReactorEvent, listener: impl FnMut(&()) + 'static) {
        self.emitter.on(event, listener);
    }

    /// Allocates a new [`EventSource`] and returns its token. The caller is
    /// responsible for registering the underlying `mio::event::Source` via
    /// [`Reactor::registry`] and [`EventSource::sync`] once interest is
    /// known (sources are created with no interest, matching connections
    /// starting paused per spec §4.4).
    pub fn new_source(&mut self) -> Token {
        let entry = self.sources.vacant_entry();
        let token = Token(entry.key());
        entry.insert(EventSource::new(token));
        token
    }

    /// Access to a previously-allocated source.
    pub fn source_mut(&mut self, token: Token) -> Option<&mut EventSource> {
        self.sources.get_mut(token.0)
    }

    /// Removes a source from the table. Callers must have already closed
    /// its kernel registration via [`EventSource::close`].
    pub fn remove_source(&mut self, token: Token) {
        if self.sources.contains(token.0) {
            self.sources.remove(token.0);
        }
    }

    /// Registers a listener that sees every readiness event dispatched for
    /// every token, regardless of whether that token has an [`EventSource`]
    /// allocated through [`Reactor::new_source`].
    ///
    /// Components that keep their own token-keyed table (the connection
    /// slab behind [`crate::net::TcpServer`] or a client pool) use this
    /// instead of per-connection `EventSource` listeners: one closure per
    /// owner, rather than one `Rc<RefCell<_>>` per connection just to get a
    /// callback wired back to it.
    pub fn on_any_io(&mut self, listener: impl FnMut(Token, IoEvent) + 'static) {
        self.any_io.push(Box::new(listener));
    }

    /// The underlying `mio::Registry`, for registering/reregistering raw
    /// `mio::event::Source`s (listening sockets, streams) against tokens
    /// allocated by [`Reactor::new_source`].
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Schedules `callback` to run once, `delta` from now. Returns a handle
    /// that cancels it idempotently, from anywhere, including from within
    /// the callback itself.
    pub fn schedule(&mut self, delta: Duration, callback: impl FnMut() + 'static) -> CancelHandle {
        use std::cell::Cell;
        use std::rc::Rc;

        let cancelled = Rc::new(Cell::new(false));
        let entry = TimerEntry {
            deadline: Instant::now() + delta,
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        };
        insert_sorted(&mut self.timers, entry);
        CancelHandle { cancelled }
    }

    /// Number of timers still pending (cancelled-but-not-yet-swept entries
    /// are included until the next sweep drops them).
    pub fn pending_timer_count(&self) -> usize {
        self.timers.len()
    }

    fn run_due_timers(&mut self, now: Instant) {
        loop {
            if !self.running {
                return;
            }
            let Some(front) = self.timers.first() else {
                return;
            };
            if front.deadline > now {
                return;
            }
            let mut entry = self.timers.remove(0);
            if !entry.cancelled.get() {
                (entry.callback)();
            }
        }
    }

    fn drain_mailbox(&mut self) {
        loop {
            let job = self.mailbox.lock().unwrap().pop_front();
            match job {
                Some(job) => job(self),
                None => break,
            }
        }
    }

    /// Dispatches one fd's readiness to its owning [`EventSource`],
    /// translating the `mio::event::Event` into the `{readable, writable,
    /// error, close}` names spec §4.2 specifies.
    fn dispatch(&mut self, event: &mio::event::Event) {
        let token = event.token();

        let mut kinds = Vec::with_capacity(4);
        if event.is_error() {
            kinds.push(IoEvent::Error);
        }
        if event.is_readable() {
            kinds.push(IoEvent::Readable);
        }
        if event.is_writable() {
            kinds.push(IoEvent::Writable);
        }
        if event.is_read_closed() || event.is_write_closed() {
            kinds.push(IoEvent::Close);
        }

        if let Some(source) = self.sources.get_mut(token.0) {
            for &kind in &kinds {
                source.emitter.emit(kind, &());
            }
        }
        for kind in kinds {
            for listener in &mut self.any_io {
                listener(token, kind);
            }
        }
    }

    /// Runs one tick: polls the readiness backend for up to `precision`,
    /// dispatches readiness, and — if at least `0.9 * precision` has
    /// elapsed since the last sweep — runs every due timer in deadline
    /// order. Returns `false` once `stop()` has been called.
    pub fn tick(&mut self) -> io::Result<bool> {
        if !self.running {
            self.running = true;
            self.emitter.emit(ReactorEvent::Start, &());
        }

        let mut events = Events::with_capacity(1024);
        let poll_start = Instant::now();
        match self.poll.poll(&mut events, Some(self.precision)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        let poll_elapsed = poll_start.elapsed();
        if poll_elapsed > self.precision * 2 {
            log::warn!(
                "reactor poll took {:?}, more than 2x precision ({:?})",
                poll_elapsed,
                self.precision
            );
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                self.drain_mailbox();
                continue;
            }
            self.dispatch(event);
        }

        let now = Instant::now();
        if now.duration_since(self.last_timer_pass) >= self.precision.mul_f64(0.9) {
            let sweep_start = Instant::now();
            self.run_due_timers(now);
            self.last_timer_pass = now;
            let sweep_elapsed = sweep_start.elapsed();
            if sweep_elapsed > self.precision * 2 {
                log::warn!(
                    "reactor timer sweep took {:?}, more than 2x precision ({:?})",
                    sweep_elapsed,
                    self.precision
                );
            }
        }

        Ok(self.running)
    }

    /// Runs `tick()` in a loop until `stop()` is called.
    pub fn run(&mut self) -> io::Result<()> {
        while self.tick()? {}
        Ok(())
    }

    /// Clears all scheduled timers, emits `stop`, and marks the reactor
    /// stopped. Individual `EventSource`s are not implicitly deregistered —
    /// their owners (connections, listeners) are responsible for closing
    /// their own registrations, since the reactor doesn't know how to close
    /// an arbitrary `mio::event::Source` it doesn't own the handle to.
    /// Safe to call `run()`/`tick()` again afterwards: `running` is
    /// re-initialized on the next `tick()`.
    pub fn stop(&mut self) {
        self.timers.clear();
        self.running = false;
        self.emitter.emit(ReactorEvent::Stop, &());
    }

    /// Whether the reactor believes itself to be running (set on the first
    /// `tick()`, cleared by `stop()`).
    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_runs_after_delta_and_not_before() {
        let mut reactor = Reactor::with_precision(Duration::from_millis(10)).unwrap();
        reactor.running = true;

        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let f = fired.clone();
        reactor.schedule(Duration::from_millis(0), move || f.set(true));

        reactor.run_due_timers(Instant::now());
        assert!(fired.get());
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_firing() {
        let mut reactor = Reactor::with_precision(Duration::from_millis(10)).unwrap();
        reactor.running = true;
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let f = fired.clone();
        let handle = reactor.schedule(Duration::from_millis(0), move || f.set(true));
        handle.delete();
        handle.delete();

        reactor.run_due_timers(Instant::now());
        assert!(!fired.get());
    }

    #[test]
    fn cancel_from_within_own_callback_is_noop() {
        let mut reactor = Reactor::with_precision(Duration::from_millis(10)).unwrap();
        reactor.running = true;

        let handle_slot: std::rc::Rc<std::cell::RefCell<Option<CancelHandle>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let slot = handle_slot.clone();
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));
        let r = ran.clone();
        let handle = reactor.schedule(Duration::from_millis(0), move || {
            r.set(true);
            if let Some(h) = slot.borrow().as_ref() {
                h.delete();
            }
        });
        *handle_slot.borrow_mut() = Some(handle);

        reactor.run_due_timers(Instant::now());
        assert!(ran.get());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor = Reactor::with_precision(Duration::from_millis(10)).unwrap();
        reactor.running = true;
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let o1 = order.clone();
        reactor.schedule(Duration::from_millis(0), move || o1.borrow_mut().push(1));
        let o2 = order.clone();
        reactor.schedule(Duration::from_millis(0), move || o2.borrow_mut().push(2));

        reactor.run_due_timers(Instant::now());
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
