use issuelog_core::db::migrations::latest_version;
use issuelog_core::db::{open_db, open_db_in_memory, DbError};
use rusqlite::Connection;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    for table in ["issues", "links", "topics", "topic_consumers", "topic_messages"] {
        assert_table_exists(&conn, table);
    }
    assert_index_exists(&conn, "issues_author_idx");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("issues.db");

    let conn_first = open_db(&path, BUSY_TIMEOUT).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path, BUSY_TIMEOUT).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_eq!(consumer_count(&conn_second), 2);
}

#[test]
fn file_database_runs_in_wal_mode() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_db(dir.path().join("issues.db"), BUSY_TIMEOUT).unwrap();

    let mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_ascii_lowercase(), "wal");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path, BUSY_TIMEOUT).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn seeded_consumers_start_at_offset_zero() {
    let conn = open_db_in_memory().unwrap();

    for (topic, consumer) in [("task_status", "email"), ("issues/updates", "test")] {
        let offset: i64 = conn
            .query_row(
                "SELECT committed_offset FROM topic_consumers WHERE topic = ?1 AND consumer = ?2;",
                [topic, consumer],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(offset, 0, "{topic}/{consumer}");
    }
}

#[test]
fn issue_writes_are_captured_by_changefeed_triggers() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO issues (id, title, created_at) VALUES ('a', 'first', 1);
         UPDATE issues SET status = 'OPEN' WHERE id = 'a';
         DELETE FROM issues WHERE id = 'a';",
    )
    .unwrap();

    let mut stmt = conn
        .prepare(
            "SELECT seq_no, CAST(data AS TEXT)
             FROM topic_messages
             WHERE topic = 'issues/updates'
             ORDER BY message_offset;",
        )
        .unwrap();
    let rows: Vec<(i64, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows.iter().map(|(seq_no, _)| *seq_no).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(rows[0].1.contains("newImage") && !rows[0].1.contains("oldImage"));
    assert!(rows[1].1.contains("newImage") && rows[1].1.contains("oldImage"));
    assert!(!rows[2].1.contains("newImage") && rows[2].1.contains("oldImage"));
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn consumer_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM topic_consumers;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    assert_schema_object(conn, "table", table_name);
}

fn assert_index_exists(conn: &Connection, index_name: &str) {
    assert_schema_object(conn, "index", index_name);
}

fn assert_schema_object(conn: &Connection, kind: &str, name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
            );",
            [kind, name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "{kind} {name} does not exist");
}
