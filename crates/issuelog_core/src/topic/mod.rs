//! Topics stored alongside the issue tables.
//!
//! # Responsibility
//! - Append messages to named topics with per-producer sequence numbers.
//! - Deliver messages to registered consumers in offset order and persist
//!   their committed offsets.
//! - Run cancellable background workers that process and commit messages.
//!
//! # Invariants
//! - Offsets grow monotonically across the store; a consumer sees the
//!   messages of one topic in offset order.
//! - `(topic, producer_id, seq_no)` is unique, so re-flushing a batch never
//!   duplicates messages.
//! - A consumer's committed offset never moves backwards.
//! - Writers and readers own their own connection to the session's file.

use crate::config::TopicConfig;
use crate::db::{open_db, DbError};
use crate::query::{execution_error, QueryError, Session};
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub mod decode;
pub mod reader;
pub mod worker;
pub mod writer;

pub use decode::{ChangeKind, ChangeRecord, IssueImage, StatusEvent};
pub use reader::TopicReader;
pub use worker::{
    ChangeLogWorker, ChangefeedHandler, MessageChannel, MessageHandler, StatusEventHandler,
    WorkerState,
};
pub use writer::TopicWriter;

pub type TopicResult<T> = Result<T, TopicError>;

#[derive(Debug)]
pub enum TopicError {
    Query(QueryError),
    Db(DbError),
    UnknownTopic(String),
    UnknownConsumer { topic: String, consumer: String },
    /// Buffered messages could not be stored; they stay buffered.
    Publish { topic: String, source: QueryError },
    Decode(String),
    Cancelled,
    /// The session is in-memory, so no second connection can reach it.
    Detached,
    WorkerPanicked(String),
}

impl TopicError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query(err) | Self::Publish { source: err, .. } => err.is_retryable(),
            Self::Cancelled => true,
            Self::Db(_)
            | Self::UnknownTopic(_)
            | Self::UnknownConsumer { .. }
            | Self::Decode(_)
            | Self::Detached
            | Self::WorkerPanicked(_) => false,
        }
    }
}

impl Display for TopicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::UnknownTopic(topic) => write!(f, "topic `{topic}` does not exist"),
            Self::UnknownConsumer { topic, consumer } => {
                write!(f, "consumer `{consumer}` is not registered for topic `{topic}`")
            }
            Self::Publish { topic, source } => {
                write!(f, "failed to publish to topic `{topic}`: {source}")
            }
            Self::Decode(message) => write!(f, "undecodable message: {message}"),
            Self::Cancelled => write!(f, "topic operation cancelled"),
            Self::Detached => write!(f, "topics require a file-backed session"),
            Self::WorkerPanicked(message) => write!(f, "worker task failed: {message}"),
        }
    }
}

impl Error for TopicError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) | Self::Publish { source: err, .. } => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueryError> for TopicError {
    fn from(value: QueryError) -> Self {
        match value {
            QueryError::Cancelled => Self::Cancelled,
            other => Self::Query(other),
        }
    }
}

impl From<DbError> for TopicError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for TopicError {
    fn from(value: rusqlite::Error) -> Self {
        execution_error(value).into()
    }
}

/// One stored topic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub offset: i64,
    pub seq_no: i64,
    pub producer_id: String,
    /// Write time in epoch milliseconds.
    pub created_at: i64,
    pub data: Vec<u8>,
}

impl Message {
    /// Payload as UTF-8 text.
    pub fn text(&self) -> TopicResult<&str> {
        std::str::from_utf8(&self.data).map_err(|err| {
            TopicError::Decode(format!("message {} is not UTF-8: {err}", self.offset))
        })
    }
}

/// Factory for writers and readers on the database behind a session.
#[derive(Debug, Clone)]
pub struct TopicClient {
    path: PathBuf,
    busy_timeout: Duration,
    config: TopicConfig,
}

impl TopicClient {
    /// Fails with `Detached` for in-memory sessions.
    pub fn new(session: &Session, config: &TopicConfig) -> TopicResult<Self> {
        let path = session.path().ok_or(TopicError::Detached)?;
        Ok(Self {
            path: path.to_path_buf(),
            busy_timeout: session.busy_timeout(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn start_writer(&self, topic: &str, producer_id: &str) -> TopicResult<TopicWriter> {
        TopicWriter::open(
            self.connect()?,
            topic,
            producer_id,
            self.config.writer_max_buffered,
        )
    }

    pub fn start_reader(&self, consumer: &str, topic: &str) -> TopicResult<TopicReader> {
        TopicReader::open(self.connect()?, consumer, topic, self.config.poll_interval())
    }

    fn connect(&self) -> TopicResult<Connection> {
        Ok(open_db(&self.path, self.busy_timeout)?)
    }
}

fn ensure_topic_exists(conn: &Connection, topic: &str) -> TopicResult<()> {
    let found = conn
        .query_row(
            "SELECT 1 FROM topics WHERE name = ?1;",
            params![topic],
            |_| Ok(()),
        )
        .optional()?;
    found.ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))
}
