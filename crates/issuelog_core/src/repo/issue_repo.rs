//! Issue repository contracts and SQL implementation.
//!
//! # Responsibility
//! - Provide CRUD, lookup and linking APIs over the `issues` and `links`
//!   tables.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - `links_count` of an issue equals the number of edges pointing at it.
//!   Linking increments both endpoints by one; deleting decrements every
//!   survivor by the number of edges it had to deleted issues. No other
//!   path touches the counter.
//! - Links are inserted and removed in mirrored pairs.
//! - Multi-row reads use engine order; callers must not rely on it.

use crate::model::issue::{now_epoch_ms, Issue, IssueId, IssueStatus, IssueTitle, LinksCount};
use crate::query::{
    column_list, execution_error, materialize, FromRow, Params, QueryError, Session, TxMode,
};
use crate::repo::schema::ensure_columns;
use log::{debug, info};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

const ISSUE_SELECT_SQL: &str = "SELECT
    id,
    title,
    created_at,
    author,
    COALESCE(links_count, 0) AS links_count,
    status
FROM issues";

const ADD_ISSUE_SQL: &str = "INSERT INTO issues (id, title, created_at, author)
VALUES (:id, :title, :created_at, :author)
ON CONFLICT (id) DO UPDATE SET
    title = excluded.title,
    created_at = excluded.created_at,
    author = excluded.author;";

const ADD_ISSUES_SQL: &str = "INSERT INTO issues (id, title, created_at)
SELECT
    json_extract(value, '$.id'),
    json_extract(value, '$.title'),
    json_extract(value, '$.created_at')
FROM json_each(:issues);";

const UPDATE_STATUS_SQL: &str = "UPDATE issues
SET status = :status
WHERE id = :id;";

const DELETE_BY_IDS_SQL: &str = "UPDATE issues
SET links_count = COALESCE(links_count, 0) - (
    SELECT COUNT(*)
    FROM links
    WHERE links.destination = issues.id
      AND links.source IN (SELECT value FROM json_each(:ids))
)
WHERE id IN (
    SELECT destination
    FROM links
    WHERE source IN (SELECT value FROM json_each(:ids))
)
  AND id NOT IN (SELECT value FROM json_each(:ids));

DELETE FROM links
WHERE source IN (SELECT value FROM json_each(:ids))
   OR destination IN (SELECT value FROM json_each(:ids));

DELETE FROM issues
WHERE id IN (SELECT value FROM json_each(:ids));";

const LINK_INCREMENT_SQL: &str = "UPDATE issues
SET links_count = COALESCE(links_count, 0) + 1
WHERE id IN (:t1, :t2);";

const LINK_INSERT_SQL: &str = "INSERT INTO links (source, destination)
VALUES (:t1, :t2), (:t2, :t1);";

const LINK_COUNTS_SQL: &str = "SELECT id, COALESCE(links_count, 0) AS links_count
FROM issues
WHERE id IN (:t1, :t2);";

const FIND_FUTURES_SQL: &str = "SELECT id, title
FROM issues
WHERE status = :future;

UPDATE issues
SET
    created_at = :now,
    status = :new
WHERE status = :future;";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for issue persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Query(QueryError),
    NotFound(IssueId),
    /// A by-id lookup matched more than one row.
    IntegrityViolation {
        id: IssueId,
        rows: usize,
    },
    InvalidTableName(String),
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
}

impl RepoError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "issue not found: {id}"),
            Self::IntegrityViolation { id, rows } => {
                write!(f, "integrity violation: {rows} rows share issue id {id}")
            }
            Self::InvalidTableName(name) => write!(f, "invalid table name `{name}`"),
            Self::MissingRequiredTable(table) => write!(f, "required table `{table}` is missing"),
            Self::MissingRequiredColumn { table, column } => {
                write!(f, "required column `{table}.{column}` is missing")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueryError> for RepoError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Query(execution_error(value))
    }
}

/// Repository interface for issue operations.
pub trait IssueRepository {
    /// Inserts one issue with a generated id and timestamp.
    fn add_issue(&self, title: &str, author: &str) -> RepoResult<Issue>;
    /// Inserts all titles in one statement; nothing is stored on failure.
    fn add_issues(&self, titles: &[String]) -> RepoResult<Vec<Issue>>;
    fn find_all(&self) -> RepoResult<Vec<Issue>>;
    /// Fails with `NotFound` on zero rows and `IntegrityViolation` on many.
    fn find_by_id(&self, id: IssueId) -> RepoResult<Issue>;
    fn find_by_ids(&self, ids: &[IssueId]) -> RepoResult<Vec<Issue>>;
    fn find_by_author(&self, author: &str) -> RepoResult<Vec<Issue>>;
    /// Returns `FUTURE` issues and re-stamps them as `NEW` in the same script.
    fn find_futures(&self) -> RepoResult<Vec<IssueTitle>>;
    /// Sets the status; an unknown id is a no-op.
    fn update_status(&self, id: IssueId, status: &IssueStatus) -> RepoResult<()>;
    fn delete(&self, id: IssueId) -> RepoResult<()>;
    /// Deletes issues with their edges; unknown ids are ignored.
    fn delete_by_ids(&self, ids: &[IssueId]) -> RepoResult<()>;
    /// Links two issues with a single script and returns both counters.
    fn link_tickets_non_interactive(&self, id1: IssueId, id2: IssueId)
        -> RepoResult<Vec<LinksCount>>;
    /// Links two issues statement by statement in one client transaction.
    fn link_tickets_interactive(&self, id1: IssueId, id2: IssueId) -> RepoResult<Vec<LinksCount>>;
}

impl<R: IssueRepository + ?Sized> IssueRepository for &R {
    fn add_issue(&self, title: &str, author: &str) -> RepoResult<Issue> {
        (**self).add_issue(title, author)
    }

    fn add_issues(&self, titles: &[String]) -> RepoResult<Vec<Issue>> {
        (**self).add_issues(titles)
    }

    fn find_all(&self) -> RepoResult<Vec<Issue>> {
        (**self).find_all()
    }

    fn find_by_id(&self, id: IssueId) -> RepoResult<Issue> {
        (**self).find_by_id(id)
    }

    fn find_by_ids(&self, ids: &[IssueId]) -> RepoResult<Vec<Issue>> {
        (**self).find_by_ids(ids)
    }

    fn find_by_author(&self, author: &str) -> RepoResult<Vec<Issue>> {
        (**self).find_by_author(author)
    }

    fn find_futures(&self) -> RepoResult<Vec<IssueTitle>> {
        (**self).find_futures()
    }

    fn update_status(&self, id: IssueId, status: &IssueStatus) -> RepoResult<()> {
        (**self).update_status(id, status)
    }

    fn delete(&self, id: IssueId) -> RepoResult<()> {
        (**self).delete(id)
    }

    fn delete_by_ids(&self, ids: &[IssueId]) -> RepoResult<()> {
        (**self).delete_by_ids(ids)
    }

    fn link_tickets_non_interactive(
        &self,
        id1: IssueId,
        id2: IssueId,
    ) -> RepoResult<Vec<LinksCount>> {
        (**self).link_tickets_non_interactive(id1, id2)
    }

    fn link_tickets_interactive(&self, id1: IssueId, id2: IssueId) -> RepoResult<Vec<LinksCount>> {
        (**self).link_tickets_interactive(id1, id2)
    }
}

/// SQL-backed issue repository borrowing a session.
pub struct SqlIssueRepository<'s> {
    session: &'s Session,
}

impl<'s> SqlIssueRepository<'s> {
    /// Constructs a repository after checking the bootstrap schema.
    pub fn try_new(session: &'s Session) -> RepoResult<Self> {
        ensure_columns(session.connection(), "issues", Issue::COLUMNS)?;
        ensure_columns(session.connection(), "links", &["source", "destination"])?;
        Ok(Self { session })
    }

    fn select_issues(&self, filter: &str, params: &Params) -> RepoResult<Vec<Issue>> {
        let mut issues: Vec<Issue> = Vec::new();
        self.session.query(
            &format!("{ISSUE_SELECT_SQL}{filter};"),
            params,
            TxMode::SnapshotReadOnly,
            |_, row| materialize(&mut issues, row),
        )?;
        Ok(issues)
    }
}

#[derive(Serialize)]
struct NewIssueRow<'a> {
    id: IssueId,
    title: &'a str,
    created_at: i64,
}

fn link_params(id1: IssueId, id2: IssueId) -> Params {
    Params::new().uuid(":t1", id1).uuid(":t2", id2)
}

impl IssueRepository for SqlIssueRepository<'_> {
    fn add_issue(&self, title: &str, author: &str) -> RepoResult<Issue> {
        let issue = Issue::new(title, Some(author.to_string()));

        self.session.execute(
            ADD_ISSUE_SQL,
            &Params::new()
                .uuid(":id", issue.id)
                .text(":title", issue.title.as_str())
                .int(":created_at", issue.created_at)
                .opt_text(":author", issue.author.as_deref()),
            TxMode::SerializableReadWrite,
        )?;

        debug!("event=issue_add module=repo status=ok id={}", issue.id);
        Ok(issue)
    }

    fn add_issues(&self, titles: &[String]) -> RepoResult<Vec<Issue>> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }

        let issues: Vec<Issue> = titles
            .iter()
            .map(|title| Issue::new(title.as_str(), None))
            .collect();
        let rows: Vec<NewIssueRow<'_>> = issues
            .iter()
            .map(|issue| NewIssueRow {
                id: issue.id,
                title: issue.title.as_str(),
                created_at: issue.created_at,
            })
            .collect();

        self.session.execute(
            ADD_ISSUES_SQL,
            &Params::new().json(":issues", &rows)?,
            TxMode::SerializableReadWrite,
        )?;

        debug!(
            "event=issue_add_batch module=repo status=ok count={}",
            issues.len()
        );
        Ok(issues)
    }

    fn find_all(&self) -> RepoResult<Vec<Issue>> {
        self.select_issues("", &Params::new())
    }

    fn find_by_id(&self, id: IssueId) -> RepoResult<Issue> {
        let mut issues = self.select_issues(" WHERE id = :id", &Params::new().uuid(":id", id))?;
        match issues.len() {
            0 => Err(RepoError::NotFound(id)),
            1 => Ok(issues.remove(0)),
            rows => Err(RepoError::IntegrityViolation { id, rows }),
        }
    }

    fn find_by_ids(&self, ids: &[IssueId]) -> RepoResult<Vec<Issue>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select_issues(
            " WHERE id IN (SELECT value FROM json_each(:ids))",
            &Params::new().uuid_list(":ids", ids),
        )
    }

    fn find_by_author(&self, author: &str) -> RepoResult<Vec<Issue>> {
        self.select_issues(" WHERE author = :author", &Params::new().text(":author", author))
    }

    fn find_futures(&self) -> RepoResult<Vec<IssueTitle>> {
        let mut futures: Vec<IssueTitle> = Vec::new();
        self.session.query(
            FIND_FUTURES_SQL,
            &Params::new()
                .text(":future", IssueStatus::Future.as_str())
                .text(":new", IssueStatus::New.as_str())
                .int(":now", now_epoch_ms()),
            TxMode::SerializableReadWrite,
            |_, row| materialize(&mut futures, row),
        )?;

        if !futures.is_empty() {
            info!(
                "event=issue_futures module=repo status=ok restamped={}",
                futures.len()
            );
        }
        Ok(futures)
    }

    fn update_status(&self, id: IssueId, status: &IssueStatus) -> RepoResult<()> {
        self.session.execute(
            UPDATE_STATUS_SQL,
            &Params::new()
                .uuid(":id", id)
                .text(":status", status.as_str()),
            TxMode::SerializableReadWrite,
        )?;
        debug!(
            "event=issue_status module=repo status=ok id={} new_status={}",
            id, status
        );
        Ok(())
    }

    fn delete(&self, id: IssueId) -> RepoResult<()> {
        self.delete_by_ids(&[id])
    }

    fn delete_by_ids(&self, ids: &[IssueId]) -> RepoResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.session.execute(
            DELETE_BY_IDS_SQL,
            &Params::new().uuid_list(":ids", ids),
            TxMode::SerializableReadWrite,
        )?;
        debug!("event=issue_delete module=repo status=ok count={}", ids.len());
        Ok(())
    }

    fn link_tickets_non_interactive(
        &self,
        id1: IssueId,
        id2: IssueId,
    ) -> RepoResult<Vec<LinksCount>> {
        let script = format!("{LINK_INCREMENT_SQL}\n{LINK_INSERT_SQL}\n{LINK_COUNTS_SQL}");
        let mut counts: Vec<LinksCount> = Vec::new();
        self.session.query(
            &script,
            &link_params(id1, id2),
            TxMode::SerializableReadWrite,
            |_, row| materialize(&mut counts, row),
        )?;

        debug!(
            "event=issue_link module=repo status=ok mode=script source={} destination={}",
            id1, id2
        );
        Ok(counts)
    }

    fn link_tickets_interactive(&self, id1: IssueId, id2: IssueId) -> RepoResult<Vec<LinksCount>> {
        let params = link_params(id1, id2);
        let counts = self.session.run_in_transaction(|tx| -> RepoResult<Vec<LinksCount>> {
            tx.execute(LINK_INCREMENT_SQL, &params)?;
            tx.execute(LINK_INSERT_SQL, &params)?;

            let mut counts: Vec<LinksCount> = Vec::new();
            tx.query(LINK_COUNTS_SQL, &params, |_, row| materialize(&mut counts, row))?;
            Ok(counts)
        })?;

        debug!(
            "event=issue_link module=repo status=ok mode=interactive source={} destination={}",
            id1, id2
        );
        Ok(counts)
    }
}

/// Select clause for the full issue row, used by the bulk read paths.
pub(crate) fn issue_columns() -> String {
    column_list::<Issue>()
}
