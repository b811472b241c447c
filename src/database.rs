//! Connection handle.
//!
//! [`Database`] re-exposes every operation of an SQLite connection as a cold
//! stream. Query calls do nothing until their stream is polled or
//! subscribed; the engine call is issued once per subscription.

use crate::adapter;
use crate::config::{positive_millis, DatabaseConfig, OpenMode};
use crate::core::db::engine::{Callback, Command, Engine, OpenConfig, Target};
use crate::core::db::{Params, Row, RunResult};
use crate::event::{DatabaseId, Emitter, EventKind, Source, StatementId};
use crate::observable::{Cold, Events, Teardown};
use crate::statement::Statement;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

struct DatabaseInner {
    id: DatabaseId,
    engine: Arc<Engine>,
    emitter: Arc<Emitter>,
}

/// A connection to an SQLite database.
///
/// The connection lives on a dedicated worker thread and is opened when the
/// handle is first used: the first query, `prepare`, `close`, or the first
/// event subscription. Open failures are only reported as `error`
/// notifications, so subscribe to [`Database::events`] before relying on the
/// connection. Clones share the same connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens or creates a database file with the given mode flags.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file, or ":memory:" for an in-memory database
    /// * `mode` - Open flags, e.g. `OpenMode::READ_WRITE | OpenMode::CREATE`
    pub fn open(path: impl Into<String>, mode: OpenMode) -> Self {
        Self::with_config(OpenConfig {
            path: path.into(),
            mode,
            busy_timeout: None,
        })
    }

    /// Opens a private in-memory database.
    pub fn open_memory() -> Self {
        Self::open(":memory:", OpenMode::default())
    }

    /// Opens a database described by a [`DatabaseConfig`].
    pub fn open_config(config: &DatabaseConfig) -> Self {
        Self::with_config(OpenConfig {
            path: config.path.clone(),
            mode: config.open_mode(),
            busy_timeout: config.busy_timeout(),
        })
    }

    fn with_config(config: OpenConfig) -> Self {
        let id = DatabaseId::next();
        let emitter = Arc::new(Emitter::new(Source::Database(id)));
        debug!(db = %id, path = %config.path, "database handle created");
        let engine = Arc::new(Engine::new(id, config, Arc::clone(&emitter)));
        Database {
            inner: Arc::new(DatabaseInner { id, engine, emitter }),
        }
    }

    pub fn id(&self) -> DatabaseId {
        self.inner.id
    }

    pub fn path(&self) -> &str {
        self.inner.engine.path()
    }

    /// Prepares a statement, binding `params` to it.
    ///
    /// Returns immediately. Compilation errors are raised on this
    /// connection's `error` channel, and every later operation on the
    /// returned statement fails with the same error.
    pub fn prepare(&self, sql: impl Into<String>, params: impl Into<Params>) -> Statement {
        let sql = sql.into();
        let id = StatementId::next();
        self.inner.engine.submit(Command::Prepare {
            id,
            sql: sql.clone(),
            params: params.into(),
        });
        Statement::new(id, sql, Arc::clone(&self.inner.engine))
    }

    /// Runs a statement, yielding the rowid and change count it produced.
    pub fn run(&self, sql: impl Into<String>, params: impl Into<Params>) -> Cold<RunResult> {
        let (target, params) = (Target::Sql(sql.into()), params.into());
        self.single_shot(move |done| Command::Run { target, params, done })
    }

    /// Yields the first matching row, or `None` when nothing matches.
    pub fn get(&self, sql: impl Into<String>, params: impl Into<Params>) -> Cold<Option<Row>> {
        let (target, params) = (Target::Sql(sql.into()), params.into());
        self.single_shot(move |done| Command::Get { target, params, done })
    }

    /// Yields every matching row as one collection.
    pub fn all(&self, sql: impl Into<String>, params: impl Into<Params>) -> Cold<Vec<Row>> {
        let (target, params) = (Target::Sql(sql.into()), params.into());
        self.single_shot(move |done| Command::All { target, params, done })
    }

    /// Yields matching rows one at a time, in result-set order.
    pub fn each(&self, sql: impl Into<String>, params: impl Into<Params>) -> Cold<Row> {
        let (target, params) = (Target::Sql(sql.into()), params.into());
        let inner = Arc::clone(&self.inner);
        Cold::new(move |sub| {
            let (row, done) = adapter::recurring(Arc::clone(&inner.emitter), sub);
            inner.engine.submit(Command::Each {
                target,
                params,
                row,
                done,
            });
            Teardown::none()
        })
    }

    /// Executes a script of one or more statements without parameters.
    pub fn exec(&self, sql: impl Into<String>) -> Cold<()> {
        let sql = sql.into();
        self.single_shot(move |done| Command::Exec { sql, done })
    }

    /// Streams the notifications named in `names`.
    ///
    /// Recognized names are `error`, `open`, `close`, `trace`, `profile`,
    /// `insert`, `update` and `delete`; anything else is ignored.
    pub fn events<I>(&self, names: I) -> Events
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let kinds: Vec<EventKind> = names
            .into_iter()
            .filter_map(|name| EventKind::from_name(name.as_ref()))
            .collect();
        self.events_of(&kinds)
    }

    /// Streams notifications of the given kinds.
    pub fn events_of(&self, kinds: &[EventKind]) -> Events {
        let engine = Arc::clone(&self.inner.engine);
        adapter::listen(Arc::clone(&self.inner.emitter), kinds.to_vec(), move || engine.start())
    }

    /// Sets how long the engine waits on a locked database before failing.
    ///
    /// Non-positive values are ignored.
    pub fn busy_timeout(&self, ms: i64) {
        if let Some(timeout) = positive_millis(ms) {
            self.inner.engine.submit(Command::BusyTimeout(timeout));
        }
    }

    /// Requests the connection to close.
    ///
    /// Completion is reported by a `close` notification; failure, including
    /// closing twice, by an `error` notification.
    pub fn close(&self) {
        self.inner.engine.submit(Command::Close);
    }

    fn single_shot<T, F>(&self, command: F) -> Cold<T>
    where
        T: Send + 'static,
        F: FnOnce(Callback<T>) -> Command + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        Cold::new(move |sub| {
            let done = adapter::once(Arc::clone(&inner.emitter), sub);
            inner.engine.submit(command(done));
            Teardown::none()
        })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("engine", &self.inner.engine)
            .finish()
    }
}
