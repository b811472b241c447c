//! Callback-to-stream adapters.
//!
//! The engine answers commands through callbacks. These helpers build those
//! callbacks from a [`Subscriber`], routing every error both to the
//! subscriber and to the diagnostic channel of the resource that owns the
//! call.

use crate::core::db::engine::{Callback, RowCallback};
use crate::core::db::Row;
use crate::core::Result;
use crate::event::{Emitter, EventKind, Notification};
use crate::observable::{Cold, Events, Subscriber, Teardown};
use std::sync::Arc;

/// Passes a successful value through; pushes an error to the subscriber and
/// then raises it on the resource.
pub(crate) fn reports<T, U>(emitter: &Emitter, sub: &Subscriber<T>, result: Result<U>) -> Option<U> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            sub.error(err.clone());
            emitter.raise(err);
            None
        }
    }
}

/// Single-shot callback: one value then completion, or one error.
pub(crate) fn once<T>(emitter: Arc<Emitter>, sub: Subscriber<T>) -> Callback<T>
where
    T: Send + 'static,
{
    once_with(emitter, sub, |value| value)
}

/// Single-shot callback whose payload is derived from the engine's result.
pub(crate) fn once_with<T, U, F>(emitter: Arc<Emitter>, sub: Subscriber<T>, payload: F) -> Callback<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(U) -> T + Send + 'static,
{
    Box::new(move |result| {
        if let Some(value) = reports(&emitter, &sub, result) {
            sub.next(payload(value));
            sub.complete();
        }
    })
}

/// Recurring callbacks: one push per row, completion once the engine
/// reports the final row count.
pub(crate) fn recurring(emitter: Arc<Emitter>, sub: Subscriber<Row>) -> (RowCallback, Callback<usize>) {
    let row_emitter = Arc::clone(&emitter);
    let row_sub = sub.clone();
    let on_row: RowCallback = Box::new(move |result| {
        if let Some(row) = reports(&row_emitter, &row_sub, result) {
            row_sub.next(row);
        }
    });
    let on_done: Callback<usize> = Box::new(move |result| {
        if reports(&emitter, &sub, result).is_some() {
            sub.complete();
        }
    });
    (on_row, on_done)
}

/// Turns listener registration into a stream.
///
/// Subscribing adds one listener per kind and then calls `on_subscribe`;
/// dropping the stream removes exactly those listeners.
pub(crate) fn listen<F>(emitter: Arc<Emitter>, kinds: Vec<EventKind>, on_subscribe: F) -> Events
where
    F: FnOnce() + Send + 'static,
{
    Events::new(Cold::new(move |sub| {
        let ids: Vec<_> = kinds
            .iter()
            .map(|&kind| {
                let sub = sub.clone();
                emitter.on(kind, Arc::new(move |n: &Notification| sub.next(n.clone())))
            })
            .collect();
        on_subscribe();
        Teardown::new(move || {
            for id in ids {
                emitter.remove_listener(id);
            }
            // Held so the stream stays open even with no listeners.
            drop(sub);
        })
    }))
}
