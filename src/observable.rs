//! Cold, push-based streams.
//!
//! A [`Cold`] stream holds a launcher: a closure that, given a
//! [`Subscriber`], performs the side-effecting call and returns a
//! [`Teardown`]. Nothing happens until the stream is first polled or
//! explicitly subscribed. The subscriber pushes values and at most one
//! terminal signal; the teardown runs exactly once, either after the
//! terminal signal has been observed or when a launched stream is dropped.

use crate::core::{Result, RxError};
use crate::event::Notification;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{FusedStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

enum Signal<T> {
    Next(T),
    Error(RxError),
    Complete,
}

/// Push side of a [`Cold`] stream.
///
/// Clones share one terminal flag: after the first `error` or `complete`
/// every further push from any clone is ignored. Pushing to a stream that
/// has been dropped is a no-op.
pub struct Subscriber<T> {
    tx: UnboundedSender<Signal<T>>,
    stopped: Arc<AtomicBool>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Subscriber {
            tx: self.tx.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl<T> Subscriber<T> {
    pub fn next(&self, value: T) {
        if !self.stopped.load(Ordering::SeqCst) {
            let _ = self.tx.unbounded_send(Signal::Next(value));
        }
    }

    pub fn error(&self, err: RxError) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.unbounded_send(Signal::Error(err));
        }
    }

    pub fn complete(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.unbounded_send(Signal::Complete);
        }
    }

    /// True once a terminal signal was pushed or the stream was dropped.
    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

/// Action released when a subscription ends.
#[derive(Default)]
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Teardown(Some(Box::new(action)))
    }

    pub fn none() -> Self {
        Teardown(None)
    }

    fn run(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

type Launcher<T> = Box<dyn FnOnce(Subscriber<T>) -> Teardown + Send>;

enum State<T> {
    Idle(Launcher<T>),
    Live {
        rx: UnboundedReceiver<Signal<T>>,
        teardown: Teardown,
    },
    Done,
}

/// A lazily started stream of `Result<T>`.
///
/// Ends after the first `Err` item. Dropping the stream unsubscribes.
#[must_use = "streams do nothing unless polled or subscribed"]
pub struct Cold<T> {
    state: State<T>,
}

impl<T: Send + 'static> Cold<T> {
    /// Creates a stream from a launcher invoked on subscription.
    pub fn new<F>(launch: F) -> Self
    where
        F: FnOnce(Subscriber<T>) -> Teardown + Send + 'static,
    {
        Cold {
            state: State::Idle(Box::new(launch)),
        }
    }

    /// Subscribes now instead of on the first poll.
    pub fn subscribe(mut self) -> Self {
        self.launch();
        self
    }

    /// Awaits the first item of the stream.
    ///
    /// Meant for single-shot calls; the rest of the stream is dropped, which
    /// still runs its teardown.
    pub async fn value(mut self) -> Result<T> {
        match self.next().await {
            Some(item) => item,
            None => Err(RxError::Closed),
        }
    }

    fn launch(&mut self) {
        if let State::Idle(_) = self.state {
            let State::Idle(launch) = std::mem::replace(&mut self.state, State::Done) else {
                return;
            };
            let (tx, rx) = mpsc::unbounded();
            let subscriber = Subscriber {
                tx,
                stopped: Arc::new(AtomicBool::new(false)),
            };
            let teardown = launch(subscriber);
            self.state = State::Live { rx, teardown };
        }
    }

    fn finish(&mut self) {
        if let State::Live { mut teardown, .. } = std::mem::replace(&mut self.state, State::Done) {
            teardown.run();
        }
    }
}

impl<T: Send + 'static> Stream for Cold<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.launch();

        let State::Live { rx, .. } = &mut this.state else {
            return Poll::Ready(None);
        };
        match rx.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Signal::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Signal::Error(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Signal::Complete)) => {
                this.finish();
                Poll::Ready(None)
            }
            // Every subscriber was dropped without a terminal signal.
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(Err(RxError::Closed)))
            }
        }
    }
}

impl<T: Send + 'static> FusedStream for Cold<T> {
    fn is_terminated(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

impl<T> Drop for Cold<T> {
    fn drop(&mut self) {
        if let State::Live { teardown, .. } = &mut self.state {
            teardown.run();
        }
    }
}

impl<T> fmt::Debug for Cold<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Idle(_) => "idle",
            State::Live { .. } => "live",
            State::Done => "done",
        };
        f.debug_struct("Cold").field("state", &state).finish()
    }
}

/// Stream of notifications from a resource's listeners.
///
/// Never ends on its own; drop it to remove the listeners.
#[must_use = "streams do nothing unless polled or subscribed"]
#[derive(Debug)]
pub struct Events(Cold<Notification>);

impl Events {
    pub(crate) fn new(inner: Cold<Notification>) -> Self {
        Events(inner)
    }

    /// Registers the listeners now instead of on the first poll.
    pub fn subscribe(self) -> Self {
        Events(self.0.subscribe())
    }
}

impl Stream for Events {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().0.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(notification))) => Poll::Ready(Some(notification)),
            Poll::Ready(_) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for Events {
    fn is_terminated(&self) -> bool {
        self.0.is_terminated()
    }
}
