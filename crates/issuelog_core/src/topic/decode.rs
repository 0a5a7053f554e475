//! Payload formats carried by the status topic and the issue changefeed.

use super::{TopicError, TopicResult};
use crate::model::issue::{IssueId, IssueStatus};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Status notification published after a successful status update.
///
/// Encoded as the text `[<id>: <status>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub id: IssueId,
    pub status: IssueStatus,
}

impl StatusEvent {
    pub fn new(id: IssueId, status: IssueStatus) -> Self {
        Self { id, status }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(text: &str) -> TopicResult<Self> {
        let malformed = || TopicError::Decode(format!("malformed status event `{text}`"));
        let body = text
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(malformed)?;
        let (id, status) = body.split_once(": ").ok_or_else(malformed)?;
        let id = IssueId::parse_str(id)
            .map_err(|err| TopicError::Decode(format!("invalid issue id `{id}`: {err}")))?;
        Ok(Self {
            id,
            status: IssueStatus::from(status),
        })
    }
}

impl Display for StatusEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}: {}]", self.id, self.status)
    }
}

/// Row image captured by the changefeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueImage {
    pub title: String,
    pub created_at: i64,
    pub author: Option<String>,
    pub links_count: Option<u64>,
    pub status: Option<IssueStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Erase,
}

/// One changefeed record: `{"key":[id],"oldImage":{..},"newImage":{..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: Vec<IssueId>,
    #[serde(rename = "oldImage", default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<IssueImage>,
    #[serde(rename = "newImage", default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<IssueImage>,
}

impl ChangeRecord {
    pub fn decode(data: &[u8]) -> TopicResult<Self> {
        let record: Self = serde_json::from_slice(data)
            .map_err(|err| TopicError::Decode(format!("invalid change record: {err}")))?;
        if record.key.is_empty() {
            return Err(TopicError::Decode("change record without key".to_string()));
        }
        if record.old_image.is_none() && record.new_image.is_none() {
            return Err(TopicError::Decode(
                "change record without images".to_string(),
            ));
        }
        Ok(record)
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.old_image, &self.new_image) {
            (None, Some(_)) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Update,
            _ => ChangeKind::Erase,
        }
    }

    /// Primary key of the changed issue.
    pub fn id(&self) -> Option<IssueId> {
        self.key.first().copied()
    }
}
