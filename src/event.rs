//! Lifecycle and diagnostic notifications, and the per-resource broadcast
//! channel they travel on.

use crate::core::RxError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`Database`](crate::Database) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabaseId(u64);

impl DatabaseId {
    pub(crate) fn next() -> Self {
        DatabaseId(NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db-{}", self.0)
    }
}

/// Process-unique identifier of a [`Statement`](crate::Statement) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(u64);

impl StatementId {
    pub(crate) fn next() -> Self {
        StatementId(NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt-{}", self.0)
    }
}

/// The resource a notification was raised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Database(DatabaseId),
    Statement(StatementId),
}

/// Kinds of notification a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Open,
    Close,
    Trace,
    Profile,
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Error,
        EventKind::Open,
        EventKind::Close,
        EventKind::Trace,
        EventKind::Profile,
        EventKind::Insert,
        EventKind::Update,
        EventKind::Delete,
    ];

    /// Resolves an event name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(EventKind::Error),
            "open" => Some(EventKind::Open),
            "close" => Some(EventKind::Close),
            "trace" => Some(EventKind::Trace),
            "profile" => Some(EventKind::Profile),
            "insert" => Some(EventKind::Insert),
            "update" => Some(EventKind::Update),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Error => "error",
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::Trace => "trace",
            EventKind::Profile => "profile",
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of a notification.
#[derive(Debug, Clone)]
pub enum Event {
    /// An error raised on the resource
    Error(RxError),
    /// The connection finished opening
    Open,
    /// The connection finished closing
    Close,
    /// A statement began executing; `sql` has bound parameters expanded
    Trace { sql: String },
    /// A statement finished executing
    Profile { sql: String, elapsed: Duration },
    /// A row was inserted into `table` of the attached `database`
    Insert { database: String, table: String, rowid: i64 },
    /// A row of `table` was updated in place
    Update { database: String, table: String, rowid: i64 },
    /// A row was deleted from `table`
    Delete { database: String, table: String, rowid: i64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Error(_) => EventKind::Error,
            Event::Open => EventKind::Open,
            Event::Close => EventKind::Close,
            Event::Trace { .. } => EventKind::Trace,
            Event::Profile { .. } => EventKind::Profile,
            Event::Insert { .. } => EventKind::Insert,
            Event::Update { .. } => EventKind::Update,
            Event::Delete { .. } => EventKind::Delete,
        }
    }
}

/// A notification raised on a database or statement.
#[derive(Debug, Clone)]
pub struct Notification {
    pub source: Source,
    pub event: Event,
}

impl Notification {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn error(&self) -> Option<&RxError> {
        match &self.event {
            Event::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        match &self.event {
            Event::Trace { sql } | Event::Profile { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

pub(crate) type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenerId(u64);

/// Fan-out list of listener closures owned by one resource.
///
/// Listeners run on whichever thread emits, outside the list lock, so a
/// listener may add or remove listeners on the same emitter.
pub(crate) struct Emitter {
    source: Source,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
}

impl Emitter {
    pub(crate) fn new(source: Source) -> Self {
        Emitter {
            source,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _, _)| *listener_id != id);
    }

    /// Delivers an event to every listener of its kind.
    ///
    /// Returns `false` when nobody was listening; the event is dropped.
    pub(crate) fn emit(&self, event: Event) -> bool {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        if targets.is_empty() {
            return false;
        }
        let notification = Notification {
            source: self.source,
            event,
        };
        for listener in targets {
            listener(&notification);
        }
        true
    }

    /// Raises an error on this resource's diagnostic channel.
    pub(crate) fn raise(&self, err: RxError) {
        if !self.emit(Event::Error(err.clone())) {
            debug!(source = ?self.source, error = %err, "unobserved error dropped");
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0);
        f.debug_struct("Emitter")
            .field("source", &self.source)
            .field("listeners", &count)
            .finish()
    }
}
