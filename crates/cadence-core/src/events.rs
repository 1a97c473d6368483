//! External event sources.
//!
//! The engine consumes anything that can deliver "the first occurrence
//! of a named event" and "the first error". [`Emitter`] is the
//! in-process implementation used by tests and demos; real adapters
//! implement [`EventSource`] over whatever transport they have.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::Fault;
use crate::handle::CompletionHandle;

pub type EventListener = Box<dyn FnOnce(Value) + Send>;
pub type ErrorListener = Box<dyn FnOnce(Fault) + Send>;

/// Minimal publish/subscribe surface consumed by `bind_first` and
/// `bind_error`.
pub trait EventSource {
    /// Subscribe to the next occurrence of `name`.
    fn once(&self, name: &str, listener: EventListener);

    /// Subscribe to the next error.
    fn once_error(&self, listener: ErrorListener);
}

/// Deliver the first occurrence of `name` into `target` as a single
/// successful completion.
pub fn bind_first(source: &dyn EventSource, name: &str, target: CompletionHandle) {
    source.once(name, Box::new(move |value| target.succeed(value)));
}

/// Deliver the source's first error into `target`.
pub fn bind_error(source: &dyn EventSource, target: CompletionHandle) {
    source.once_error(Box::new(move |fault| target.fail(fault)));
}

/// In-memory event source. Listeners are one-shot: every listener
/// waiting on a name is consumed by the first matching emit.
#[derive(Default)]
pub struct Emitter {
    listeners: Mutex<HashMap<String, Vec<EventListener>>>,
    error_listeners: Mutex<Vec<ErrorListener>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, name: &str, value: Value) {
        let waiting = self
            .listeners
            .lock()
            .expect("emitter listeners poisoned")
            .remove(name);
        if let Some(waiting) = waiting {
            for listener in waiting {
                listener(value.clone());
            }
        }
    }

    pub fn emit_error(&self, fault: Fault) {
        let waiting = std::mem::take(
            &mut *self
                .error_listeners
                .lock()
                .expect("emitter error listeners poisoned"),
        );
        for listener in waiting {
            listener(fault.clone());
        }
    }
}

impl EventSource for Emitter {
    fn once(&self, name: &str, listener: EventListener) {
        self.listeners
            .lock()
            .expect("emitter listeners poisoned")
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }

    fn once_error(&self, listener: ErrorListener) {
        self.error_listeners
            .lock()
            .expect("emitter error listeners poisoned")
            .push(listener);
    }
}
