//! A small, generic publish/subscribe layer.
//!
//! The wire-protocol pieces of this crate (the reactor, connections, codecs,
//! exchanges) all expose their lifecycle through an [`EventEmitter`] rather
//! than bespoke callback fields, so that consumers subscribe the same way
//! regardless of which subsystem they're watching.
//!
//! Event names are a generic parameter `E: Copy + Eq` rather than strings —
//! each subsystem defines its own small enum (see [`crate::reactor::ReactorEvent`],
//! [`crate::net::connection::ConnEvent`]) instead of paying for string
//! comparisons on every dispatch.

use std::fmt;

type Listener<A> = Box<dyn FnMut(&A)>;

struct Entry<E, A> {
    event: E,
    listener: Listener<A>,
    once: bool,
    /// Set by the listener itself (or by a concurrent `remove_listener`)
    /// during dispatch; checked before invoking so a listener can remove
    /// itself or a sibling without invalidating the index-walk.
    removed: bool,
}

/// A multi-listener publish/subscribe emitter with once-semantics and a
/// sink fallback.
///
/// `E` is the event-name type (typically a small `Copy` enum); `A` is the
/// argument type passed to listeners for every event. If a subsystem needs
/// to emit different payloads for different events, `A` should be an enum
/// covering all of them.
pub struct EventEmitter<E, A> {
    entries: Vec<Entry<E, A>>,
    sink: Option<Box<dyn FnMut(E, &A)>>,
}

impl<E, A> fmt::Debug for EventEmitter<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.entries.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl<E, A> Default for EventEmitter<E, A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            sink: None,
        }
    }
}

impl<E, A> EventEmitter<E, A>
where
    E: Copy + PartialEq,
{
    /// Creates an emitter with no listeners and no sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` to run every time `event` is emitted, in the
    /// order listeners were added.
    pub fn on(&mut self, event: E, listener: impl FnMut(&A) + 'static) {
        self.entries.push(Entry {
            event,
            listener: Box::new(listener),
            once: false,
            removed: false,
        });
    }

    /// Registers `listener` to run at most once. Re-entrant emits of the
    /// same event from within the listener body will not re-invoke it: the
    /// entry is marked removed *before* the listener runs.
    pub fn once(&mut self, event: E, listener: impl FnMut(&A) + 'static) {
        self.entries.push(Entry {
            event,
            listener: Box::new(listener),
            once: true,
            removed: false,
        });
    }

    /// Removes the fallback sink, if any.
    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    /// Installs a fallback dispatch target: when `emit(event, ...)` finds no
    /// listener registered for `event`, `handler` is invoked instead of
    /// nothing happening. Used for class-level "default handler" dispatch.
    pub fn sink(&mut self, handler: impl FnMut(E, &A) + 'static) {
        self.sink = Some(Box::new(handler));
    }

    /// Removes every listener registered for `event`. A no-op if none are
    /// registered.
    ///
    /// Safe to call from within a listener invoked during the current
    /// dispatch of `event`: entries already entered keep running to
    /// completion; ones not yet reached are skipped because `remove_listeners`
    /// marks them `removed` rather than shifting indices out from under the
    /// in-progress walk.
    pub fn remove_listeners(&mut self, event: Option<E>) {
        match event {
            Some(event) => {
                for entry in &mut self.entries {
                    if entry.event == event {
                        entry.removed = true;
                    }
                }
            }
            None => {
                for entry in &mut self.entries {
                    entry.removed = true;
                }
            }
        }
        self.entries.retain(|e| !e.removed);
    }

    /// Emits `event` with argument `args`, invoking every still-live
    /// listener registered for it in registration order.
    ///
    /// If no listener is registered for `event` and a sink has been
    /// installed, the sink is invoked instead. Implemented as an index walk
    /// re-checking `self.entries.len()` on every iteration, so a listener
    /// that removes entries (including itself) during dispatch cannot panic
    /// on a stale index; entries it adds during dispatch are *not* run in
    /// the same emit (they weren't there when the walk started past them).
    pub fn emit(&mut self, event: E, args: &A) {
        let starting_len = self.entries.len();
        let mut invoked = false;
        let mut i = 0;
        while i < self.entries.len().min(starting_len) {
            if self.entries[i].event != event || self.entries[i].removed {
                i += 1;
                continue;
            }

            let once = self.entries[i].once;
            if once {
                self.entries[i].removed = true;
            }
            invoked = true;

            // Re-entrant listeners may push/remove entries; borrow the
            // listener out for the duration of the call so `self` stays
            // available to them.
            let mut listener = std::mem::replace(&mut self.entries[i].listener, Box::new(|_| {}));
            listener(args);
            if let Some(entry) = self.entries.get_mut(i) {
                if !entry.removed {
                    entry.listener = listener;
                }
            }

            i += 1;
        }

        self.entries.retain(|e| !e.removed);

        if !invoked {
            if let Some(sink) = &mut self.sink {
                sink(event, args);
            }
        }
    }

    /// Removes a single listener. No generic equality exists over listener
    /// closures, so this crate's consumers identify listeners by a small
    /// opaque [`ListenerId`] returned from `on`/`once` rather than by value;
    /// see [`EventEmitter::on_with_id`].
    pub fn remove_listener(&mut self, id: ListenerId) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.removed = true;
        }
        self.entries.retain(|e| !e.removed);
    }

    /// Like [`EventEmitter::on`], but returns an id that can be passed to
    /// [`EventEmitter::remove_listener`].
    pub fn on_with_id(&mut self, event: E, listener: impl FnMut(&A) + 'static) -> ListenerId {
        self.entries.push(Entry {
            event,
            listener: Box::new(listener),
            once: false,
            removed: false,
        });
        ListenerId(self.entries.len() - 1)
    }

    /// Number of currently-registered (non-removed) listeners across all
    /// events. Exposed for tests asserting re-entrant removal semantics.
    pub fn listener_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.removed).count()
    }
}

/// Opaque handle identifying a single listener for targeted removal.
///
/// Indices are only valid until the next `remove_listeners`/`emit` compacts
/// the entry list; holding one across such a call and then using it is a
/// logic error (it will silently no-op or remove the wrong listener if the
/// slot was reused). Callers should remove promptly after receiving the id,
/// or prefer `remove_listeners(Some(event))` to clear a whole event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Ev {
        A,
        B,
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut emitter: EventEmitter<Ev, ()> = EventEmitter::new();

        let o1 = order.clone();
        emitter.on(Ev::A, move |_| o1.borrow_mut().push(1));
        let o2 = order.clone();
        emitter.on(Ev::A, move |_| o2.borrow_mut().push(2));

        emitter.emit(Ev::A, &());
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn once_listener_fires_at_most_once_even_when_reentrant() {
        let count = Rc::new(RefCell::new(0));
        let mut emitter: Rc<RefCell<EventEmitter<Ev, ()>>> =
            Rc::new(RefCell::new(EventEmitter::new()));

        let c = count.clone();
        let inner = emitter.clone();
        emitter.borrow_mut().once(Ev::A, move |_| {
            *c.borrow_mut() += 1;
            // re-entrant emit from within the listener body
            inner.borrow_mut().emit(Ev::A, &());
        });

        emitter.borrow_mut().emit(Ev::A, &());
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn listener_removing_itself_during_dispatch_does_not_panic() {
        let mut emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        let id = Rc::new(RefCell::new(None));
        let id2 = id.clone();
        let emitter = Rc::new(RefCell::new(emitter));
        let weak = emitter.clone();
        let lid = emitter.borrow_mut().on_with_id(Ev::A, move |_| {
            if let Some(id) = *id2.borrow() {
                weak.borrow_mut().remove_listener(id);
            }
        });
        *id.borrow_mut() = Some(lid);

        emitter.borrow_mut().emit(Ev::A, &());
        assert_eq!(emitter.borrow().listener_count(), 0);
    }

    #[test]
    fn unregistered_event_falls_back_to_sink() {
        let seen = Rc::new(RefCell::new(None));
        let mut emitter: EventEmitter<Ev, i32> = EventEmitter::new();
        let s = seen.clone();
        emitter.sink(move |ev, args| {
            *s.borrow_mut() = Some((matches!(ev, Ev::B), *args));
        });

        emitter.emit(Ev::B, &42);
        assert_eq!(*seen.borrow(), Some((true, 42)));
    }

    #[test]
    fn remove_listeners_with_no_event_clears_everything() {
        let mut emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        emitter.on(Ev::A, |_| {});
        emitter.on(Ev::B, |_| {});
        emitter.remove_listeners(None);
        assert_eq!(emitter.listener_count(), 0);
    }
}
