//! Stream-based access to SQLite.
//!
//! Every callback-style operation of an SQLite connection is re-exposed as a
//! cold stream: nothing touches the database until the stream is polled or
//! subscribed, and dropping a stream unsubscribes from it.
//!
//! ```ignore
//! use futures::TryStreamExt;
//! use rxsqlite::{params, Database};
//!
//! let db = Database::open_memory();
//! db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").value().await?;
//! db.run("INSERT INTO t (name) VALUES (?)", params!["alice"]).value().await?;
//! let rows: Vec<_> = db.each("SELECT * FROM t", ()).try_collect().await?;
//! ```

// Core infrastructure modules
pub mod config;
pub mod core;
pub mod event;
pub mod observable;

// Resource handles
mod adapter;
pub mod database;
pub mod statement;

pub use crate::config::{load_config, parse_config, DatabaseConfig, ModeFlag, OpenMode};
pub use crate::core::db::{Params, Row, RunResult, Value};
pub use crate::core::{Result, RxError};
pub use crate::database::Database;
pub use crate::event::{DatabaseId, Event, EventKind, Notification, Source, StatementId};
pub use crate::observable::{Cold, Events, Subscriber, Teardown};
pub use crate::statement::Statement;
