//! Schema migrations for the issue store.
//!
//! Scripts are numbered from 1 without gaps and recorded in
//! `PRAGMA user_version`. Every script is idempotent (`IF NOT EXISTS` /
//! `OR IGNORE`), so a database bootstrapped by hand can still be brought
//! under versioning.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, Transaction, TransactionBehavior};

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "issues_and_links",
        sql: include_str!("0001_issues.sql"),
    },
    Migration {
        version: 2,
        name: "author_index",
        sql: include_str!("0002_author_index.sql"),
    },
    Migration {
        version: 3,
        name: "topics",
        sql: include_str!("0003_topics.sql"),
    },
    Migration {
        version: 4,
        name: "issues_changefeed",
        sql: include_str!("0004_issues_changefeed.sql"),
    },
];

/// Schema version produced by the last registered migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Brings `conn` to [`latest_version`].
///
/// Writer and reader connections run this on every open, so an up-to-date
/// file returns without taking the write lock. Pending scripts run in one
/// `BEGIN IMMEDIATE` transaction, and the version is re-read under the
/// lock because another connection may have migrated in between.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let latest = latest_version();
    let version = schema_version(conn)?;
    ensure_supported(version, latest)?;
    if version == latest {
        return Ok(());
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let locked_version = schema_version(&tx)?;
    ensure_supported(locked_version, latest)?;
    let applied = apply_pending(&tx, MIGRATIONS, locked_version)?;
    tx.commit()?;

    if applied > 0 {
        info!(
            "event=db_migrate module=db status=ok from_version={} to_version={} applied={}",
            locked_version, latest, applied
        );
    }
    Ok(())
}

fn apply_pending(tx: &Transaction<'_>, migrations: &[Migration], after: u32) -> DbResult<usize> {
    let mut applied = 0;
    for migration in migrations.iter().filter(|m| m.version > after) {
        tx.execute_batch(migration.sql)
            .and_then(|()| {
                tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))
            })
            .map_err(|source| DbError::Migration {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        applied += 1;
    }
    Ok(applied)
}

fn ensure_supported(version: u32, latest: u32) -> DbResult<()> {
    if version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: version,
            latest_supported: latest,
        });
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::{apply_pending, schema_version, Migration, MIGRATIONS};
    use crate::db::DbError;
    use rusqlite::Connection;

    #[test]
    fn registry_is_numbered_without_gaps() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version as usize, index + 1, "{}", migration.name);
        }
    }

    #[test]
    fn failing_script_names_the_migration_and_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let broken = [
            Migration {
                version: 1,
                name: "good",
                sql: "CREATE TABLE kept (id INTEGER);",
            },
            Migration {
                version: 2,
                name: "broken",
                sql: "CREATE TABLE oops (;",
            },
        ];

        let tx = conn.transaction().unwrap();
        let err = apply_pending(&tx, &broken, 0).unwrap_err();
        drop(tx);

        assert!(matches!(
            err,
            DbError::Migration { version: 2, name: "broken", .. }
        ));
        assert_eq!(schema_version(&conn).unwrap(), 0);
        let kept: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'kept';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kept, 0);
    }
}
