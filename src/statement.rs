//! Prepared statement handle.
//!
//! A [`Statement`] refers to a compiled statement owned by its connection's
//! engine worker. Query calls on it are single use: once the stream ends, or
//! is dropped, the statement is finalized. Calling [`Statement::bind`] or
//! [`Statement::reset`] hands the lifecycle to the caller instead, who then
//! finalizes explicitly or by dropping the last handle.

use crate::adapter;
use crate::core::db::engine::{Callback, Command, Engine, Target};
use crate::core::db::{Params, Row, RunResult};
use crate::core::RxError;
use crate::event::{Emitter, EventKind, Source, StatementId};
use crate::observable::{Cold, Events, Teardown};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

struct StatementInner {
    id: StatementId,
    sql: String,
    engine: Arc<Engine>,
    emitter: Arc<Emitter>,
    /// Set once a finalize has been submitted
    finalized: AtomicBool,
    /// Set once the caller took over the lifecycle through bind or reset
    retained: AtomicBool,
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        self.engine.submit(Command::Finalize {
            id,
            done: Box::new(move |result| {
                if let Err(err) = result {
                    trace!(stmt = %id, error = %err, "finalize on drop failed");
                }
            }),
        });
    }
}

/// A prepared statement.
///
/// Clones refer to the same compiled statement.
#[derive(Clone)]
pub struct Statement {
    inner: Arc<StatementInner>,
}

impl Statement {
    pub(crate) fn new(id: StatementId, sql: String, engine: Arc<Engine>) -> Self {
        Statement {
            inner: Arc::new(StatementInner {
                id,
                sql,
                engine,
                emitter: Arc::new(Emitter::new(Source::Statement(id))),
                finalized: AtomicBool::new(false),
                retained: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> StatementId {
        self.inner.id
    }

    /// The SQL text the statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Whether a finalize has been issued for this statement.
    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// Streams the errors raised on this statement.
    pub fn errors(&self) -> Events {
        let engine = Arc::clone(&self.inner.engine);
        adapter::listen(Arc::clone(&self.inner.emitter), vec![EventKind::Error], move || {
            engine.start()
        })
    }

    /// Runs the statement, yielding the rowid and change count it produced.
    ///
    /// Non-empty `params` replace the parameters bound so far.
    pub fn run(&self, params: impl Into<Params>) -> Cold<RunResult> {
        let (target, params) = (self.target(), params.into());
        self.single_use(move |done| Command::Run { target, params, done })
    }

    /// Yields the next row, or `None` once the result set is exhausted.
    pub fn get(&self, params: impl Into<Params>) -> Cold<Option<Row>> {
        let (target, params) = (self.target(), params.into());
        self.single_use(move |done| Command::Get { target, params, done })
    }

    pub fn all(&self, params: impl Into<Params>) -> Cold<Vec<Row>> {
        let (target, params) = (self.target(), params.into());
        self.single_use(move |done| Command::All { target, params, done })
    }

    pub fn each(&self, params: impl Into<Params>) -> Cold<Row> {
        let (target, params) = (self.target(), params.into());
        let stmt = self.clone();
        Cold::new(move |sub| {
            let (row, done) = adapter::recurring(Arc::clone(&stmt.inner.emitter), sub);
            stmt.inner.engine.submit(Command::Each {
                target,
                params,
                row,
                done,
            });
            Teardown::new(move || stmt.release())
        })
    }

    /// Replaces the bound parameters and rewinds the statement.
    ///
    /// Yields the statement itself so further calls can be chained.
    pub fn bind(&self, params: impl Into<Params>) -> Cold<Statement> {
        let params = params.into();
        let id = self.inner.id;
        self.lifecycle(move |done| Command::Bind { id, params, done })
    }

    /// Rewinds the statement, keeping its bound parameters.
    pub fn reset(&self) -> Cold<Statement> {
        let id = self.inner.id;
        self.lifecycle(move |done| Command::Reset { id, done })
    }

    /// Releases the compiled statement.
    ///
    /// Finalizing twice fails with [`RxError::Finalized`].
    pub fn finalize(&self) -> Cold<Statement> {
        let stmt = self.clone();
        Cold::new(move |sub| {
            let (id, engine) = (stmt.inner.id, Arc::clone(&stmt.inner.engine));
            let emitter = Arc::clone(&stmt.inner.emitter);
            let already = stmt.inner.finalized.swap(true, Ordering::SeqCst);
            let done = adapter::once_with(emitter, sub, move |()| stmt);
            if already {
                done(Err(RxError::Finalized));
            } else {
                engine.submit(Command::Finalize { id, done });
            }
            Teardown::none()
        })
    }

    fn target(&self) -> Target {
        Target::Statement(self.inner.id)
    }

    fn single_use<T, F>(&self, command: F) -> Cold<T>
    where
        T: Send + 'static,
        F: FnOnce(Callback<T>) -> Command + Send + 'static,
    {
        let stmt = self.clone();
        Cold::new(move |sub| {
            let done = adapter::once(Arc::clone(&stmt.inner.emitter), sub);
            stmt.inner.engine.submit(command(done));
            Teardown::new(move || stmt.release())
        })
    }

    fn lifecycle<F>(&self, command: F) -> Cold<Statement>
    where
        F: FnOnce(Callback<()>) -> Command + Send + 'static,
    {
        let stmt = self.clone();
        Cold::new(move |sub| {
            stmt.inner.retained.store(true, Ordering::SeqCst);
            let (emitter, engine) = (Arc::clone(&stmt.inner.emitter), Arc::clone(&stmt.inner.engine));
            let done = adapter::once_with(emitter, sub, move |()| stmt);
            engine.submit(command(done));
            Teardown::none()
        })
    }

    /// Finalizes after a single-use call unless the caller retained the
    /// statement. Errors go to the statement's channel.
    fn release(&self) {
        if self.inner.retained.load(Ordering::SeqCst) || self.inner.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let emitter = Arc::clone(&self.inner.emitter);
        self.inner.engine.submit(Command::Finalize {
            id: self.inner.id,
            done: Box::new(move |result| {
                if let Err(err) = result {
                    emitter.raise(err);
                }
            }),
        });
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.inner.id)
            .field("sql", &self.inner.sql)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
