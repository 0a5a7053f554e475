//! Consumer-side reader of one topic.

use super::worker::MessageChannel;
use super::{ensure_topic_exists, Message, TopicError, TopicResult};
use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMMITTED_OFFSET_SQL: &str = "SELECT committed_offset
FROM topic_consumers
WHERE topic = ?1 AND consumer = ?2;";

const NEXT_MESSAGE_SQL: &str = "SELECT message_offset, seq_no, producer_id, created_at, data
FROM topic_messages
WHERE topic = ?1 AND message_offset > ?2
ORDER BY message_offset
LIMIT 1;";

const COMMIT_SQL: &str = "UPDATE topic_consumers
SET committed_offset = MAX(committed_offset, ?3)
WHERE topic = ?1 AND consumer = ?2;";

/// Reads one topic on behalf of a registered consumer.
///
/// Delivery resumes after the consumer's committed offset. Messages read
/// but not committed are delivered again after `rewind` or by the next
/// reader opened for the same consumer.
pub struct TopicReader {
    conn: Connection,
    topic: String,
    consumer: String,
    poll_interval: Duration,
    committed: i64,
    position: i64,
}

impl TopicReader {
    pub(super) fn open(
        conn: Connection,
        consumer: &str,
        topic: &str,
        poll_interval: Duration,
    ) -> TopicResult<Self> {
        ensure_topic_exists(&conn, topic)?;
        let committed: i64 = conn
            .query_row(COMMITTED_OFFSET_SQL, params![topic, consumer], |row| row.get(0))
            .optional()?
            .ok_or_else(|| TopicError::UnknownConsumer {
                topic: topic.to_string(),
                consumer: consumer.to_string(),
            })?;

        info!(
            "event=reader_open module=topic status=ok topic={} consumer={} committed_offset={}",
            topic, consumer, committed
        );
        Ok(Self {
            conn,
            topic: topic.to_string(),
            consumer: consumer.to_string(),
            poll_interval,
            committed,
            position: committed,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn committed_offset(&self) -> i64 {
        self.committed
    }

    /// Returns the next message past the read position, if one is stored.
    pub fn try_read(&mut self) -> TopicResult<Option<Message>> {
        let message = self
            .conn
            .prepare_cached(NEXT_MESSAGE_SQL)?
            .query_row(params![self.topic, self.position], |row| {
                Ok(Message {
                    topic: self.topic.clone(),
                    offset: row.get("message_offset")?,
                    seq_no: row.get("seq_no")?,
                    producer_id: row.get("producer_id")?,
                    created_at: row.get("created_at")?,
                    data: row.get("data")?,
                })
            })
            .optional()?;

        if let Some(message) = &message {
            self.position = message.offset;
        }
        Ok(message)
    }

    /// Waits until a message is available or `cancel` fires.
    pub async fn read_message(&mut self, cancel: &CancellationToken) -> TopicResult<Message> {
        loop {
            if cancel.is_cancelled() {
                return Err(TopicError::Cancelled);
            }
            if let Some(message) = self.try_read()? {
                return Ok(message);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TopicError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Records `message` as processed. Committing an older offset than the
    /// stored one leaves the stored offset unchanged.
    pub fn commit(&mut self, message: &Message) -> TopicResult<()> {
        self.conn.execute(
            COMMIT_SQL,
            params![self.topic, self.consumer, message.offset],
        )?;
        self.committed = self.committed.max(message.offset);
        debug!(
            "event=reader_commit module=topic status=ok topic={} consumer={} offset={}",
            self.topic, self.consumer, self.committed
        );
        Ok(())
    }

    /// Moves the read position back to the committed offset.
    pub fn rewind(&mut self) {
        self.position = self.committed;
    }

    pub fn close(self) -> TopicResult<()> {
        let Self {
            conn,
            topic,
            consumer,
            ..
        } = self;
        conn.close().map_err(|(_, err)| TopicError::from(err))?;
        info!(
            "event=reader_close module=topic status=ok topic={} consumer={}",
            topic, consumer
        );
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for TopicReader {
    async fn read(&mut self, cancel: &CancellationToken) -> TopicResult<Message> {
        self.read_message(cancel).await
    }

    fn commit(&mut self, message: &Message) -> TopicResult<()> {
        TopicReader::commit(self, message)
    }

    fn rewind(&mut self) {
        TopicReader::rewind(self)
    }

    fn close(self) -> TopicResult<()> {
        TopicReader::close(self)
    }
}
