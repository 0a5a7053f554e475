//! Database bootstrap for the issue store.
//!
//! # Responsibility
//! - Open session, writer and reader connections to the same file with the
//!   same pragmas.
//! - Bring the schema (issues, links, topics, changefeed triggers) to the
//!   latest version before a connection is handed out.
//!
//! # Invariants
//! - `PRAGMA user_version` holds the last applied migration.
//! - A file connection is only returned once WAL is active; without it
//!   topic readers and writers would block the session.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failure while opening or bootstrapping a connection.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The file was written by a newer build.
    UnsupportedSchemaVersion { db_version: u32, latest_supported: u32 },
    /// SQLite kept a different journal mode than the one requested.
    JournalMode {
        requested: &'static str,
        actual: String,
    },
    /// A migration script failed; nothing from it was applied.
    Migration {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "schema version {db_version} is unknown to this build (latest {latest_supported})"
            ),
            Self::JournalMode { requested, actual } => {
                write!(f, "journal mode `{requested}` rejected, database stays in `{actual}`")
            }
            Self::Migration {
                version,
                name,
                source,
            } => write!(f, "migration {version} ({name}) failed: {source}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::UnsupportedSchemaVersion { .. } | Self::JournalMode { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
