//! Subscriber callbacks for stanza and error events.
//!
//! The dispatcher calls handlers synchronously, one stanza at a time, in
//! arrival order. A panicking handler is caught and logged; it never
//! takes the dispatcher down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

use tracing::{debug, error};

use crate::error::Error;
use crate::stanza::{Iq, Message, Presence, Stanza};

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Handlers {
    message: RwLock<Option<Handler<Message>>>,
    presence: RwLock<Option<Handler<Presence>>>,
    iq: RwLock<Option<Handler<Iq>>>,
    error: RwLock<Option<Handler<Error>>>,
}

impl Handlers {
    pub fn set_message(&self, handler: Handler<Message>) {
        *self.message.write().expect("handler lock") = Some(handler);
    }

    pub fn set_presence(&self, handler: Handler<Presence>) {
        *self.presence.write().expect("handler lock") = Some(handler);
    }

    pub fn set_iq(&self, handler: Handler<Iq>) {
        *self.iq.write().expect("handler lock") = Some(handler);
    }

    pub fn set_error(&self, handler: Handler<Error>) {
        *self.error.write().expect("handler lock") = Some(handler);
    }

    pub fn dispatch(&self, stanza: Stanza) {
        match stanza {
            Stanza::Message(message) => self.invoke(&self.message, message, "message"),
            Stanza::Presence(presence) => self.invoke(&self.presence, presence, "presence"),
            Stanza::Iq(iq) => self.invoke(&self.iq, iq, "iq"),
        }
    }

    pub fn emit_error(&self, condition: Error) {
        self.invoke(&self.error, condition, "error");
    }

    fn invoke<T>(&self, slot: &RwLock<Option<Handler<T>>>, value: T, kind: &str) {
        let guard = slot.read().expect("handler lock");
        match guard.as_ref() {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                    error!("{kind} handler panicked, dispatcher continues");
                }
            }
            None => debug!("no {kind} handler registered, event dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message() -> Stanza {
        Stanza::Message(Message {
            to: None,
            from: None,
            id: None,
            language: None,
            payload: Vec::new(),
        })
    }

    #[test]
    fn test_dispatch_reaches_registered_handler() {
        let handlers = Handlers::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        handlers.set_message(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.dispatch(message());
        handlers.dispatch(message());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handlers = Handlers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handlers.set_message(Box::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first call explodes");
            }
        }));

        handlers.dispatch(message());
        // The handler table is still usable after the panic.
        handlers.dispatch(message());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_handler_is_ignored() {
        let handlers = Handlers::default();
        handlers.dispatch(message());
        handlers.emit_error(Error::Disconnected);
    }
}
