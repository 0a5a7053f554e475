//! Issue domain model and projections.
//!
//! # Responsibility
//! - Define the canonical issue record and the projections returned by
//!   repository operations.
//! - Map result rows to structs by column name.
//!
//! # Invariants
//! - `id` and `created_at` are assigned at creation; `find_futures` is the
//!   only operation allowed to re-stamp `created_at`.
//! - `links_count` equals the number of link edges pointing at the issue;
//!   a NULL column is read as `0`.

use crate::query::FromRow;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable identifier of an issue.
pub type IssueId = Uuid;

/// Issue workflow status.
///
/// Statuses are stored as free text; values outside the known set are kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueStatus {
    Open,
    InProgress,
    /// Scheduled for later; picked up and re-stamped by `find_futures`.
    Future,
    New,
    Other(String),
}

impl IssueStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Future => "FUTURE",
            Self::New => "NEW",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<&str> for IssueStatus {
    fn from(value: &str) -> Self {
        match value {
            "OPEN" => Self::Open,
            "IN_PROGRESS" => Self::InProgress,
            "FUTURE" => Self::Future,
            "NEW" => Self::New,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for IssueStatus {
    fn from(value: String) -> Self {
        match Self::from(value.as_str()) {
            Self::Other(_) => Self::Other(value),
            known => known,
        }
    }
}

impl From<IssueStatus> for String {
    fn from(value: IssueStatus) -> Self {
        match value {
            IssueStatus::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for IssueStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical issue record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    pub author: Option<String>,
    pub links_count: u64,
    pub status: Option<IssueStatus>,
}

impl Issue {
    /// Creates a fresh issue with a generated id and the current timestamp.
    pub fn new(title: impl Into<String>, author: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            created_at: now_epoch_ms(),
            author,
            links_count: 0,
            status: None,
        }
    }
}

impl FromRow for Issue {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "title",
        "created_at",
        "author",
        "links_count",
        "status",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: uuid_column(row, "id")?,
            title: row.get("title")?,
            created_at: row.get("created_at")?,
            author: row.get("author")?,
            links_count: links_count_column(row)?,
            status: row
                .get::<_, Option<String>>("status")?
                .map(IssueStatus::from),
        })
    }
}

/// `(id, title)` projection returned by `find_futures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTitle {
    pub id: IssueId,
    pub title: String,
}

impl FromRow for IssueTitle {
    const COLUMNS: &'static [&'static str] = &["id", "title"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: uuid_column(row, "id")?,
            title: row.get("title")?,
        })
    }
}

/// `(id, links_count)` projection returned by the link operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinksCount {
    pub id: IssueId,
    pub links_count: u64,
}

impl FromRow for LinksCount {
    const COLUMNS: &'static [&'static str] = &["id", "links_count"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: uuid_column(row, "id")?,
            links_count: links_count_column(row)?,
        })
    }
}

/// Bulk-load input; becomes an `Issue` on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleAuthor {
    pub title: String,
    pub author: String,
}

impl TitleAuthor {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

fn uuid_column(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let text: String = row.get(column)?;
    Uuid::parse_str(&text).map_err(|err| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn links_count_column(row: &Row<'_>) -> rusqlite::Result<u64> {
    let value: Option<i64> = row.get("links_count")?;
    let value = value.unwrap_or(0);
    u64::try_from(value).map_err(|_| {
        let index = row.as_ref().column_index("links_count").unwrap_or_default();
        rusqlite::Error::IntegralValueOutOfRange(index, value)
    })
}

#[cfg(test)]
mod tests {
    use super::IssueStatus;

    #[test]
    fn known_statuses_roundtrip_through_text() {
        for status in [
            IssueStatus::Open,
            IssueStatus::InProgress,
            IssueStatus::Future,
            IssueStatus::New,
        ] {
            assert_eq!(IssueStatus::from(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_is_preserved_verbatim() {
        let status = IssueStatus::from("BLOCKED".to_string());
        assert_eq!(status, IssueStatus::Other("BLOCKED".to_string()));
        assert_eq!(String::from(status), "BLOCKED");
    }
}
