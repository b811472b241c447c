//! Integration tests for the connection handle

mod common;

use common::{init_tracing, people_db, within};
use futures::{StreamExt, TryStreamExt};
use rusqlite::ErrorCode;
use rxsqlite::{params, named_params, Database, DatabaseConfig, Event, EventKind, OpenMode, RxError, Source, Value};

#[tokio::test]
async fn test_open_failure_is_reported_as_error_event() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("app.db");
    let db = Database::open(path.to_string_lossy(), OpenMode::READ_WRITE);

    let mut errors = db.events(["error"]).subscribe();
    let notification = within(errors.next()).await.unwrap();
    assert_eq!(notification.source, Source::Database(db.id()));
    assert_eq!(notification.error().and_then(RxError::sqlite_code), Some(ErrorCode::CannotOpen));

    // Later calls fail with the same cause.
    let err = within(db.all("SELECT 1", ()).value()).await.unwrap_err();
    assert_eq!(err.sqlite_code(), Some(ErrorCode::CannotOpen));
}

#[tokio::test]
async fn test_open_and_close_events() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let db = Database::open(path.to_string_lossy(), OpenMode::READ_WRITE | OpenMode::CREATE);
    assert_eq!(db.path(), path.to_string_lossy());

    let mut events = db.events(["open", "close", "error"]).subscribe();
    assert_eq!(within(events.next()).await.unwrap().kind(), EventKind::Open);
    assert!(path.exists());

    db.close();
    assert_eq!(within(events.next()).await.unwrap().kind(), EventKind::Close);

    // Closing twice reports an error instead of a second close.
    db.close();
    let second = within(events.next()).await.unwrap();
    assert!(matches!(second.error(), Some(RxError::Closed)));

    let err = within(db.get("SELECT 1", ()).value()).await.unwrap_err();
    assert!(matches!(err, RxError::Closed));
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
    }

    let db = Database::open(path.to_string_lossy(), OpenMode::READ_ONLY);
    let err = within(db.run("INSERT INTO t VALUES (1)", ()).value()).await.unwrap_err();
    assert_eq!(err.sqlite_code(), Some(ErrorCode::ReadOnly));
    let rows = within(db.all("SELECT * FROM t", ()).value()).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_run_reports_rowid_and_changes() {
    let db = people_db().await;

    let inserted = within(db.run("INSERT INTO people (name, age) VALUES (?, ?)", params!["dave", 19]).value())
        .await
        .unwrap();
    assert_eq!(inserted.last_insert_rowid, 4);
    assert_eq!(inserted.changes, 1);

    let updated = within(db.run("UPDATE people SET age = age + 1 WHERE age > ?", params![30]).value())
        .await
        .unwrap();
    assert_eq!(updated.changes, 2);
}

#[tokio::test]
async fn test_run_error_reaches_stream_and_error_channel() {
    let db = people_db().await;
    let mut errors = db.events(["error"]).subscribe();

    let err = within(db.run("INSERT INTO people (name) VALUES (NULL)", ()).value())
        .await
        .unwrap_err();
    assert_eq!(err.sqlite_code(), Some(ErrorCode::ConstraintViolation));

    let raised = within(errors.next()).await.unwrap();
    assert_eq!(raised.source, Source::Database(db.id()));
    assert_eq!(
        raised.error().and_then(RxError::sqlite_code),
        Some(ErrorCode::ConstraintViolation)
    );
}

#[tokio::test]
async fn test_get_and_all() {
    let db = people_db().await;

    let row = within(db.get("SELECT name, age FROM people WHERE age > ? ORDER BY age", params![30]).value())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("alice")));
    assert_eq!(row.get("age").and_then(Value::as_i64), Some(34));

    let none = within(db.get("SELECT * FROM people WHERE age > 100", ()).value()).await.unwrap();
    assert!(none.is_none());

    let rows = within(
        db.all("SELECT name FROM people WHERE name <> :skip ORDER BY id", named_params![":skip" => "bob"])
            .value(),
    )
    .await
    .unwrap();
    let names: Vec<_> = rows.iter().filter_map(|r| r.get("name").and_then(Value::as_str)).collect();
    assert_eq!(names, vec!["alice", "carol"]);
}

#[tokio::test]
async fn test_all_on_memory_database() {
    init_tracing();
    let db = Database::open(":memory:", OpenMode::default());
    let batches: Vec<_> = within(db.all("SELECT 1 AS one", ()).try_collect::<Vec<_>>()).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].get("one"), Some(&Value::Integer(1)));
}

#[tokio::test]
async fn test_each_streams_rows_in_order() {
    let db = people_db().await;

    let rows: Vec<_> = within(db.each("SELECT name FROM people ORDER BY id", ()).try_collect::<Vec<_>>())
        .await
        .unwrap();
    let names: Vec<_> = rows
        .iter()
        .map(|r| r.get_index(0).and_then(Value::as_str).unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["alice", "bob", "carol"]);

    let empty: Vec<_> = within(db.each("SELECT * FROM people WHERE 0", ()).try_collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(empty.is_empty());

    let failed: Vec<_> = within(db.each("SELECT * FROM nowhere", ()).collect::<Vec<_>>()).await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_err());
}

#[tokio::test]
async fn test_exec_runs_scripts() {
    init_tracing();
    let db = Database::open_memory();
    within(db.exec("CREATE TABLE a (x); CREATE TABLE b (y); INSERT INTO b VALUES (1);").value())
        .await
        .unwrap();
    let tables = within(db.all("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", ()).value())
        .await
        .unwrap();
    assert_eq!(tables.len(), 2);

    let err = within(db.exec("CREATE TABLE a (x)").value()).await.unwrap_err();
    assert!(matches!(err, RxError::Database(_)));
}

#[tokio::test]
async fn test_trace_and_profile_carry_sql() {
    init_tracing();
    let db = Database::open_memory();
    let mut events = db.events(["trace", "profile"]).subscribe();

    within(db.get("SELECT 42", ()).value()).await.unwrap();

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        let notification = within(events.next()).await.unwrap();
        if notification.sql() == Some("SELECT 42") {
            kinds.push(notification.kind());
        }
    }
    assert_eq!(kinds, vec![EventKind::Trace, EventKind::Profile]);
}

#[tokio::test]
async fn test_row_change_events() {
    let db = people_db().await;
    let mut changes = db.events(["insert", "update", "delete"]).subscribe();

    within(db.run("INSERT INTO people (name) VALUES ('erin')", ()).value()).await.unwrap();
    within(db.run("UPDATE people SET age = 30 WHERE name = 'erin'", ()).value()).await.unwrap();
    within(db.run("DELETE FROM people WHERE name = 'erin'", ()).value()).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let notification = within(changes.next()).await.unwrap();
        match notification.event {
            Event::Insert { table, rowid, .. } | Event::Update { table, rowid, .. } | Event::Delete { table, rowid, .. } => {
                assert_eq!(table, "people");
                assert_eq!(rowid, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
        seen.push(notification.source);
    }
    assert!(seen.iter().all(|source| *source == Source::Database(db.id())));
}

#[tokio::test]
async fn test_unknown_event_names_are_ignored() {
    init_tracing();
    let db = Database::open_memory();
    let mut events = db.events(["bogus", "open"]).subscribe();
    assert_eq!(within(events.next()).await.unwrap().kind(), EventKind::Open);
}

#[tokio::test]
async fn test_busy_timeout() {
    let db = people_db().await;

    db.busy_timeout(1500);
    let row = within(db.get("PRAGMA busy_timeout", ()).value()).await.unwrap().unwrap();
    assert_eq!(row.get_index(0).and_then(Value::as_i64), Some(1500));

    // Non-positive values leave the timeout alone.
    db.busy_timeout(0);
    db.busy_timeout(-10);
    let row = within(db.get("PRAGMA busy_timeout", ()).value()).await.unwrap().unwrap();
    assert_eq!(row.get_index(0).and_then(Value::as_i64), Some(1500));
}

#[tokio::test]
async fn test_open_config() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = DatabaseConfig::new(dir.path().join("configured.db").to_string_lossy());
    config.busy_timeout_ms = Some(200);

    let db = Database::open_config(&config);
    let row = within(db.get("PRAGMA busy_timeout", ()).value()).await.unwrap().unwrap();
    assert_eq!(row.get_index(0).and_then(Value::as_i64), Some(200));
}

#[tokio::test]
async fn test_streams_are_cold() {
    let db = people_db().await;

    // Built but never polled: no engine call is made.
    let pending = db.run("DELETE FROM people", ());
    drop(pending);

    let insert = db.run("INSERT INTO people (name) VALUES ('frank')", ());
    assert_eq!(count_people(&db).await, Some(3));

    within(insert.value()).await.unwrap();
    assert_eq!(count_people(&db).await, Some(4));
}

async fn count_people(db: &Database) -> Option<i64> {
    within(db.get("SELECT COUNT(*) AS n FROM people", ()).value())
        .await
        .unwrap()
        .and_then(|row| row.get("n").and_then(Value::as_i64))
}

#[tokio::test]
async fn test_each_subscription_runs_its_own_query() {
    let db = people_db().await;
    let first = db.run("INSERT INTO people (name) VALUES ('gina')", ()).subscribe();
    let second = db.run("INSERT INTO people (name) VALUES ('hank')", ()).subscribe();

    let a = within(first.value()).await.unwrap();
    let b = within(second.value()).await.unwrap();
    assert_eq!((a.last_insert_rowid, b.last_insert_rowid), (4, 5));
}

#[tokio::test]
async fn test_clones_share_the_connection() {
    let db = people_db().await;
    let other = db.clone();
    assert_eq!(db.id(), other.id());

    within(other.run("DELETE FROM people WHERE name = 'bob'", ()).value()).await.unwrap();
    let rows = within(db.all("SELECT * FROM people", ()).value()).await.unwrap();
    assert_eq!(rows.len(), 2);
}
