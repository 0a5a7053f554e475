//! Key-value repository over issue-shaped tables.
//!
//! `bulk_upsert` runs one cached prepared statement per row in autocommit
//! mode: rows are independent, so a failure part-way leaves the earlier rows
//! stored. Reads run against a snapshot and are ordered by primary key.

use crate::model::issue::{Issue, IssueId, TitleAuthor};
use crate::query::{check_cancelled, execution_error, materialize, Params, Session, TxMode};
use crate::repo::issue_repo::{issue_columns, RepoError, RepoResult};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::params;
use std::time::Instant;

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("table name pattern is valid")
});

/// Bulk loader borrowing a session.
pub struct KeyValueRepository<'s> {
    session: &'s Session,
}

impl<'s> KeyValueRepository<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }

    /// Upserts every `(title, author)` pair as a new issue row and returns
    /// the generated ids in input order.
    pub fn bulk_upsert(&self, table: &str, rows: &[TitleAuthor]) -> RepoResult<Vec<IssueId>> {
        let table = validate_table_name(table)?;
        let started_at = Instant::now();

        let mut stmt = self
            .session
            .connection()
            .prepare_cached(&format!(
                "INSERT INTO \"{table}\" (id, title, author, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                    title = excluded.title,
                    author = excluded.author,
                    created_at = excluded.created_at;"
            ))
            .map_err(execution_error)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            check_cancelled(self.session.cancellation())?;
            let issue = Issue::new(row.title.as_str(), Some(row.author.clone()));
            stmt.execute(params![
                issue.id.to_string(),
                issue.title,
                issue.author,
                issue.created_at
            ])
            .map_err(execution_error)?;
            ids.push(issue.id);
        }

        info!(
            "event=bulk_upsert module=bulk status=ok table={} rows={} duration_ms={}",
            table,
            ids.len(),
            started_at.elapsed().as_millis()
        );
        Ok(ids)
    }

    /// Reads the whole table from one snapshot, ordered by `id`.
    pub fn read_table(&self, table: &str) -> RepoResult<Vec<Issue>> {
        let table = validate_table_name(table)?;
        let mut issues: Vec<Issue> = Vec::new();
        self.session.query(
            &format!("SELECT {} FROM \"{table}\" ORDER BY id;", issue_columns()),
            &Params::new(),
            TxMode::SnapshotReadOnly,
            |_, row| materialize(&mut issues, row),
        )?;
        Ok(issues)
    }

    /// Point multi-get by primary key, ordered by `id`; unknown keys are skipped.
    pub fn read_rows(&self, table: &str, ids: &[IssueId]) -> RepoResult<Vec<Issue>> {
        let table = validate_table_name(table)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut issues: Vec<Issue> = Vec::new();
        self.session.query(
            &format!(
                "SELECT {}
                 FROM \"{table}\"
                 WHERE id IN (SELECT value FROM json_each(:ids))
                 ORDER BY id;",
                issue_columns()
            ),
            &Params::new().uuid_list(":ids", ids),
            TxMode::SnapshotReadOnly,
            |_, row| materialize(&mut issues, row),
        )?;
        Ok(issues)
    }
}

fn validate_table_name(table: &str) -> RepoResult<&str> {
    if TABLE_NAME.is_match(table) {
        Ok(table)
    } else {
        Err(RepoError::InvalidTableName(table.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_table_name;
    use crate::repo::issue_repo::RepoError;

    #[test]
    fn plain_identifiers_are_accepted() {
        assert_eq!(validate_table_name("issues").unwrap(), "issues");
        assert_eq!(validate_table_name("_staging2").unwrap(), "_staging2");
    }

    #[test]
    fn quoting_and_separators_are_rejected() {
        for name in ["", "2issues", "issues; DROP TABLE links", "is\"sues", "main.issues"] {
            assert!(matches!(
                validate_table_name(name),
                Err(RepoError::InvalidTableName(_))
            ));
        }
    }
}
