//! Status update use case.
//!
//! # Responsibility
//! - Persist a status change through the repository.
//! - Publish the matching `[<id>: <status>]` notification.
//!
//! # Invariants
//! - The notification is only written after the update committed.
//! - A publish failure is reported but the committed update is kept.

use crate::model::issue::{IssueId, IssueStatus};
use crate::repo::issue_repo::{IssueRepository, RepoError};
use crate::topic::{StatusEvent, TopicClient, TopicError, TopicWriter};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum StatusUpdateError {
    Update(RepoError),
    Publish(TopicError),
}

impl StatusUpdateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Update(err) => err.is_retryable(),
            Self::Publish(err) => err.is_retryable(),
        }
    }
}

impl Display for StatusUpdateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Update(err) => write!(f, "status update failed: {err}"),
            Self::Publish(err) => write!(f, "status notification failed: {err}"),
        }
    }
}

impl Error for StatusUpdateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Update(err) => Some(err),
            Self::Publish(err) => Some(err),
        }
    }
}

impl From<RepoError> for StatusUpdateError {
    fn from(value: RepoError) -> Self {
        Self::Update(value)
    }
}

impl From<TopicError> for StatusUpdateError {
    fn from(value: TopicError) -> Self {
        Self::Publish(value)
    }
}

/// Updates issue statuses and announces them on the status topic.
pub struct StatusUpdateService<R: IssueRepository> {
    repo: R,
    writer: TopicWriter,
}

impl<R: IssueRepository> StatusUpdateService<R> {
    pub fn new(repo: R, writer: TopicWriter) -> Self {
        Self { repo, writer }
    }

    /// Opens a writer on the configured status topic with the configured
    /// producer id.
    pub fn start(repo: R, topics: &TopicClient) -> Result<Self, TopicError> {
        let config = topics.config();
        let writer = topics.start_writer(&config.status_topic, &config.status_producer_id)?;
        Ok(Self::new(repo, writer))
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Updates the status, then publishes the notification and flushes it.
    pub fn update(&mut self, id: IssueId, status: &IssueStatus) -> Result<(), StatusUpdateError> {
        self.repo.update_status(id, status)?;

        let event = StatusEvent::new(id, status.clone());
        let published = self
            .writer
            .write(event.encode())
            .and_then(|_| self.writer.flush());
        if let Err(err) = published {
            warn!(
                "event=status_publish module=service status=error issue_id={} error={}",
                id, err
            );
            return Err(err.into());
        }

        info!(
            "event=status_update module=service status=ok issue_id={} issue_status={}",
            id, status
        );
        Ok(())
    }

    /// Flushes outstanding notifications and closes the writer.
    pub fn shutdown(self) -> Result<(), StatusUpdateError> {
        self.writer.close()?;
        info!("event=status_service_shutdown module=service status=ok");
        Ok(())
    }
}
