//! Issue log client library.
//!
//! Issues, their links and two topics (status notifications and the issue
//! changefeed) live in one embedded SQLite database. Repositories run
//! parameterized scripts through a [`Session`]; topic writers, readers and
//! background workers each use their own connection to the same file.

pub mod bulk;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod query;
pub mod repo;
pub mod service;
pub mod topic;

pub use bulk::key_value_repo::KeyValueRepository;
pub use config::{ClientConfig, ConfigError, DatabaseConfig, LoggingConfig, TopicConfig};
pub use db::{DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::issue::{Issue, IssueId, IssueStatus, IssueTitle, LinksCount, TitleAuthor};
pub use query::{Params, QueryError, QueryResult, Session, TxHandle, TxMode};
pub use repo::issue_repo::{IssueRepository, RepoError, RepoResult, SqlIssueRepository};
pub use service::status_update_service::{StatusUpdateError, StatusUpdateService};
pub use topic::{
    ChangeLogWorker, ChangeRecord, Message, StatusEvent, TopicClient, TopicError, TopicReader,
    TopicResult, TopicWriter, WorkerState,
};

/// Returns the crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
