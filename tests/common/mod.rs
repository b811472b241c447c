//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rxsqlite::Database;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Awaits `future`, failing the test if it takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for the engine")
}

pub const PEOPLE_SCHEMA: &str = "
    CREATE TABLE people (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        age INTEGER
    );
    INSERT INTO people (name, age) VALUES ('alice', 34);
    INSERT INTO people (name, age) VALUES ('bob', 27);
    INSERT INTO people (name, age) VALUES ('carol', 41);
";

/// An in-memory database holding the `people` fixture.
pub async fn people_db() -> Database {
    init_tracing();
    let db = Database::open_memory();
    within(db.exec(PEOPLE_SCHEMA).value())
        .await
        .expect("Failed to create fixture schema");
    db
}
