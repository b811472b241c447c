//! Engine Worker Module
//!
//! This module owns the SQLite connection. Every connection runs on its own
//! worker thread; callers talk to it by sending [`Command`]s that carry
//! completion callbacks, and the worker answers each command by invoking its
//! callbacks on the worker thread, strictly in submission order.
use crate::config::OpenMode;
use crate::core::db::value::{column_names, Params, Row, RunResult};
use crate::core::{Result, RxError};
use crate::event::{DatabaseId, Emitter, Event, StatementId};
use once_cell::sync::OnceCell;
use rusqlite::hooks::Action;
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Completion callback of a single-shot command
pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Per-row callback of a recurring command
pub(crate) type RowCallback = Box<dyn FnMut(Result<Row>) + Send>;

/// What a query command executes against
#[derive(Debug, Clone)]
pub(crate) enum Target {
    /// Ad-hoc SQL compiled for this call only
    Sql(String),
    /// A prepared statement slot
    Statement(StatementId),
}

/// Work items understood by the engine worker
pub(crate) enum Command {
    Prepare {
        id: StatementId,
        sql: String,
        params: Params,
    },
    Run {
        target: Target,
        params: Params,
        done: Callback<RunResult>,
    },
    Get {
        target: Target,
        params: Params,
        done: Callback<Option<Row>>,
    },
    All {
        target: Target,
        params: Params,
        done: Callback<Vec<Row>>,
    },
    Each {
        target: Target,
        params: Params,
        row: RowCallback,
        done: Callback<usize>,
    },
    Exec {
        sql: String,
        done: Callback<()>,
    },
    Bind {
        id: StatementId,
        params: Params,
        done: Callback<()>,
    },
    Reset {
        id: StatementId,
        done: Callback<()>,
    },
    Finalize {
        id: StatementId,
        done: Callback<()>,
    },
    BusyTimeout(Duration),
    Close,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Prepare { .. } => "prepare",
            Command::Run { .. } => "run",
            Command::Get { .. } => "get",
            Command::All { .. } => "all",
            Command::Each { .. } => "each",
            Command::Exec { .. } => "exec",
            Command::Bind { .. } => "bind",
            Command::Reset { .. } => "reset",
            Command::Finalize { .. } => "finalize",
            Command::BusyTimeout(_) => "busy_timeout",
            Command::Close => "close",
        }
    }

    /// Answers a command that never reached the worker.
    ///
    /// Commands without a callback report on the connection's channel.
    fn reject(self, err: RxError, emitter: &Emitter) {
        match self {
            Command::Run { done, .. } => done(Err(err)),
            Command::Get { done, .. } => done(Err(err)),
            Command::All { done, .. } => done(Err(err)),
            Command::Each { done, .. } => done(Err(err)),
            Command::Exec { done, .. } => done(Err(err)),
            Command::Bind { done, .. } => done(Err(err)),
            Command::Reset { done, .. } => done(Err(err)),
            Command::Finalize { done, .. } => done(Err(err)),
            Command::Prepare { .. } | Command::BusyTimeout(_) | Command::Close => emitter.raise(err),
        }
    }
}

/// Parameters the worker opens the connection with
#[derive(Debug, Clone)]
pub(crate) struct OpenConfig {
    pub path: String,
    pub mode: OpenMode,
    pub busy_timeout: Option<Duration>,
}

/// Handle to a connection's worker thread
///
/// The worker is spawned, and the connection opened, on the first submitted
/// command so that listeners registered before that point observe the
/// outcome of the open.
pub(crate) struct Engine {
    id: DatabaseId,
    config: OpenConfig,
    emitter: Arc<Emitter>,
    tx: Sender<Command>,
    rx: Mutex<Option<Receiver<Command>>>,
    started: OnceCell<()>,
}

impl Engine {
    pub(crate) fn new(id: DatabaseId, config: OpenConfig, emitter: Arc<Emitter>) -> Self {
        let (tx, rx) = mpsc::channel();
        Engine {
            id,
            config,
            emitter,
            tx,
            rx: Mutex::new(Some(rx)),
            started: OnceCell::new(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.config.path
    }

    /// Starts the worker if it is not running yet.
    pub(crate) fn start(&self) {
        self.started.get_or_init(|| {
            let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(rx) = rx else {
                return;
            };
            let worker = Worker {
                id: self.id,
                conn: None,
                failure: None,
                slots: HashMap::new(),
                emitter: Arc::clone(&self.emitter),
            };
            let config = self.config.clone();
            let spawned = thread::Builder::new()
                .name(format!("rxsqlite-{}", self.id))
                .spawn(move || worker.run(config, rx));
            if let Err(e) = spawned {
                error!(db = %self.id, error = %e, "failed to spawn engine worker");
                self.emitter.raise(RxError::from(e));
            }
        });
    }

    /// Sends a command to the worker, answering it with `Closed` if the
    /// worker is gone.
    pub(crate) fn submit(&self, command: Command) {
        self.start();
        trace!(db = %self.id, command = command.name(), "submit");
        if let Err(mpsc::SendError(command)) = self.tx.send(command) {
            debug!(db = %self.id, command = command.name(), "engine worker is gone");
            command.reject(RxError::Closed, &self.emitter);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("path", &self.config.path)
            .field("started", &self.started.get().is_some())
            .finish()
    }
}

/// A prepared statement as the worker sees it
///
/// The compiled form lives in the connection's statement cache; the slot
/// keeps what is needed to re-acquire it plus the binding state and the
/// rows still to be handed out by `get`.
struct Slot {
    sql: String,
    params: Params,
    /// Result set being walked by successive `get` calls
    pending: Option<VecDeque<Row>>,
    /// Set when compiling or binding failed at prepare time
    broken: Option<RxError>,
}

thread_local! {
    /// Emitter the trace and profile hooks of this worker thread report to.
    static HOOK_SINK: RefCell<Option<Arc<Emitter>>> = const { RefCell::new(None) };
}

fn trace_hook(sql: &str) {
    HOOK_SINK.with(|sink| {
        if let Some(emitter) = sink.borrow().as_ref() {
            emitter.emit(Event::Trace { sql: sql.to_owned() });
        }
    });
}

fn profile_hook(sql: &str, elapsed: Duration) {
    HOOK_SINK.with(|sink| {
        if let Some(emitter) = sink.borrow().as_ref() {
            emitter.emit(Event::Profile {
                sql: sql.to_owned(),
                elapsed,
            });
        }
    });
}

struct Worker {
    id: DatabaseId,
    conn: Option<Connection>,
    /// Why the connection is unavailable, if it failed to open
    failure: Option<RxError>,
    slots: HashMap<StatementId, Slot>,
    emitter: Arc<Emitter>,
}

impl Worker {
    fn run(mut self, config: OpenConfig, rx: Receiver<Command>) {
        debug!(db = %self.id, path = %config.path, "engine worker started");
        self.open(&config);
        while let Ok(command) = rx.recv() {
            trace!(db = %self.id, command = command.name(), "dispatch");
            self.dispatch(command);
        }
        self.release_hooks();
        debug!(db = %self.id, "engine worker stopped");
    }

    fn open(&mut self, config: &OpenConfig) {
        match Connection::open_with_flags(&config.path, config.mode.to_flags()) {
            Ok(mut conn) => {
                if let Some(timeout) = config.busy_timeout {
                    if let Err(e) = conn.busy_timeout(timeout) {
                        warn!(db = %self.id, error = %e, "failed to apply busy timeout");
                    }
                }
                self.install_hooks(&mut conn);
                self.conn = Some(conn);
                debug!(db = %self.id, "connection opened");
                self.emitter.emit(Event::Open);
            }
            Err(e) => {
                let err = RxError::from(e);
                warn!(db = %self.id, error = %err, "failed to open connection");
                self.failure = Some(err.clone());
                self.emitter.raise(err);
            }
        }
    }

    fn install_hooks(&self, conn: &mut Connection) {
        HOOK_SINK.with(|sink| *sink.borrow_mut() = Some(Arc::clone(&self.emitter)));
        conn.trace(Some(trace_hook));
        conn.profile(Some(profile_hook));

        let emitter = Arc::clone(&self.emitter);
        conn.update_hook(Some(move |action: Action, database: &str, table: &str, rowid: i64| {
            let (database, table) = (database.to_owned(), table.to_owned());
            let event = match action {
                Action::SQLITE_INSERT => Event::Insert { database, table, rowid },
                Action::SQLITE_UPDATE => Event::Update { database, table, rowid },
                Action::SQLITE_DELETE => Event::Delete { database, table, rowid },
                _ => return,
            };
            emitter.emit(event);
        }));
    }

    fn release_hooks(&self) {
        HOOK_SINK.with(|sink| *sink.borrow_mut() = None);
    }

    fn connection(&self) -> Result<&Connection> {
        match &self.conn {
            Some(conn) => Ok(conn),
            None => Err(self.failure.clone().unwrap_or(RxError::Closed)),
        }
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Prepare { id, sql, params } => self.prepare(id, sql, params),
            Command::Run { target, params, done } => done(self.run_query(&target, params)),
            Command::Get { target, params, done } => done(self.get(&target, params)),
            Command::All { target, params, done } => done(self.all(&target, params)),
            Command::Each {
                target,
                params,
                mut row,
                done,
            } => {
                // A row error has already been reported; the final callback
                // is skipped.
                if let Some(outcome) = self.each(&target, params, &mut row) {
                    done(outcome);
                }
            }
            Command::Exec { sql, done } => done(self.exec(&sql)),
            Command::Bind { id, params, done } => done(self.bind(id, params)),
            Command::Reset { id, done } => done(self.reset(id)),
            Command::Finalize { id, done } => done(self.finalize(id)),
            Command::BusyTimeout(timeout) => {
                let applied = self
                    .connection()
                    .and_then(|conn| conn.busy_timeout(timeout).map_err(RxError::from));
                if let Err(err) = applied {
                    self.emitter.raise(err);
                }
            }
            Command::Close => self.close(),
        }
    }

    fn prepare(&mut self, id: StatementId, sql: String, params: Params) {
        let compiled = self.connection().and_then(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            params.bind_to(&mut stmt)?;
            Ok(())
        });
        let broken = match compiled {
            Ok(()) => None,
            Err(err) => {
                debug!(db = %self.id, stmt = %id, error = %err, "prepare failed");
                self.emitter.raise(err.clone());
                Some(err)
            }
        };
        self.slots.insert(
            id,
            Slot {
                sql,
                params,
                pending: None,
                broken,
            },
        );
    }

    /// Resolves a target into SQL text and the parameters to bind.
    ///
    /// Non-empty call parameters replace a slot's bound parameters.
    fn resolve(&self, target: &Target, params: Params) -> Result<(String, Params)> {
        match target {
            Target::Sql(sql) => Ok((sql.clone(), params)),
            Target::Statement(id) => {
                let slot = self.slot(*id)?;
                let params = if params.is_empty() {
                    slot.params.clone()
                } else {
                    params
                };
                Ok((slot.sql.clone(), params))
            }
        }
    }

    fn slot(&self, id: StatementId) -> Result<&Slot> {
        self.connection()?;
        let slot = self.slots.get(&id).ok_or(RxError::Finalized)?;
        match &slot.broken {
            Some(err) => Err(err.clone()),
            None => Ok(slot),
        }
    }

    fn slot_mut(&mut self, id: StatementId) -> Result<&mut Slot> {
        self.connection()?;
        let slot = self.slots.get_mut(&id).ok_or(RxError::Finalized)?;
        match &slot.broken {
            Some(err) => Err(err.clone()),
            None => Ok(slot),
        }
    }

    /// Rewinds a statement slot once a full pass has run.
    fn rewind(&mut self, target: &Target, params: &Params) {
        if let Target::Statement(id) = target {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.pending = None;
                if !params.is_empty() {
                    slot.params = params.clone();
                }
            }
        }
    }

    fn run_query(&mut self, target: &Target, params: Params) -> Result<RunResult> {
        let (sql, params) = self.resolve(target, params)?;
        let conn = self.connection()?;
        let outcome = {
            let mut stmt = conn.prepare_cached(&sql)?;
            params.bind_to(&mut stmt)?;
            let mut rows = stmt.raw_query();
            while rows.next()?.is_some() {}
            RunResult {
                last_insert_rowid: conn.last_insert_rowid(),
                changes: conn.changes(),
            }
        };
        self.rewind(target, &params);
        Ok(outcome)
    }

    fn get(&mut self, target: &Target, params: Params) -> Result<Option<Row>> {
        let id = match target {
            Target::Statement(id) => *id,
            Target::Sql(sql) => return self.first_row(sql, &params),
        };
        if !params.is_empty() {
            let slot = self.slot_mut(id)?;
            slot.params = params;
            slot.pending = None;
        }
        if self.slot(id)?.pending.is_none() {
            let (sql, params) = self.resolve(target, Params::default())?;
            let rows = self.query(&sql, &params)?;
            self.slot_mut(id)?.pending = Some(rows.into());
        }
        let slot = self.slot_mut(id)?;
        let next = slot.pending.as_mut().and_then(VecDeque::pop_front);
        // Stepping past the end rewinds.
        if next.is_none() {
            slot.pending = None;
        }
        Ok(next)
    }

    fn first_row(&self, sql: &str, params: &Params) -> Result<Option<Row>> {
        let mut stmt = self.connection()?.prepare_cached(sql)?;
        params.bind_to(&mut stmt)?;
        let columns = column_names(&stmt);
        let mut rows = stmt.raw_query();
        let first = match rows.next()? {
            Some(row) => Some(Row::from_sqlite(&columns, row)?),
            None => None,
        };
        Ok(first)
    }

    fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>> {
        let mut stmt = self.connection()?.prepare_cached(sql)?;
        params.bind_to(&mut stmt)?;
        let columns = column_names(&stmt);
        let mut rows = stmt.raw_query();
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            collected.push(Row::from_sqlite(&columns, row)?);
        }
        Ok(collected)
    }

    fn all(&mut self, target: &Target, params: Params) -> Result<Vec<Row>> {
        let (sql, params) = self.resolve(target, params)?;
        let collected = self.query(&sql, &params)?;
        self.rewind(target, &params);
        Ok(collected)
    }

    /// Streams rows into `on_row`; returns the final outcome, or `None` when
    /// a row-level error was already delivered.
    fn each(&mut self, target: &Target, params: Params, on_row: &mut RowCallback) -> Option<Result<usize>> {
        let resolved = self.resolve(target, params);
        let (sql, params) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => return Some(Err(err)),
        };
        let streamed = match self.connection() {
            Ok(conn) => stream_rows(conn, &sql, &params, on_row),
            Err(err) => return Some(Err(err)),
        };
        match streamed {
            Streamed::Done(count) => {
                self.rewind(target, &params);
                Some(Ok(count))
            }
            Streamed::Failed(err) => Some(Err(err)),
            Streamed::RowFailed => None,
        }
    }

    fn exec(&self, sql: &str) -> Result<()> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    fn bind(&mut self, id: StatementId, params: Params) -> Result<()> {
        let sql = self.slot(id)?.sql.clone();
        {
            let mut stmt = self.connection()?.prepare_cached(&sql)?;
            params.bind_to(&mut stmt)?;
        }
        let slot = self.slot_mut(id)?;
        slot.params = params;
        slot.pending = None;
        Ok(())
    }

    fn reset(&mut self, id: StatementId) -> Result<()> {
        self.slot_mut(id)?.pending = None;
        Ok(())
    }

    fn finalize(&mut self, id: StatementId) -> Result<()> {
        self.connection()?;
        match self.slots.remove(&id) {
            Some(_) => {
                trace!(db = %self.id, stmt = %id, "statement finalized");
                Ok(())
            }
            None => Err(RxError::Finalized),
        }
    }

    fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            self.emitter.raise(self.failure.clone().unwrap_or(RxError::Closed));
            return;
        };
        match conn.close() {
            Ok(()) => {
                self.slots.clear();
                self.release_hooks();
                debug!(db = %self.id, "connection closed");
                self.emitter.emit(Event::Close);
            }
            Err((conn, e)) => {
                warn!(db = %self.id, error = %e, "failed to close connection");
                self.conn = Some(conn);
                self.emitter.raise(RxError::from(e));
            }
        }
    }
}

enum Streamed {
    Done(usize),
    Failed(RxError),
    RowFailed,
}

fn stream_rows(conn: &Connection, sql: &str, params: &Params, on_row: &mut RowCallback) -> Streamed {
    let mut stmt = match conn.prepare_cached(sql) {
        Ok(stmt) => stmt,
        Err(e) => return Streamed::Failed(e.into()),
    };
    if let Err(e) = params.bind_to(&mut stmt) {
        return Streamed::Failed(e.into());
    }
    let columns = column_names(&stmt);
    let mut rows = stmt.raw_query();
    let mut count = 0;
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => Row::from_sqlite(&columns, row),
            Ok(None) => return Streamed::Done(count),
            Err(e) => Err(e),
        };
        match row {
            Ok(row) => {
                count += 1;
                on_row(Ok(row));
            }
            Err(e) => {
                on_row(Err(e.into()));
                return Streamed::RowFailed;
            }
        }
    }
}
