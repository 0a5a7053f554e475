//! Buffered topic writer with a stable producer id.

use super::{ensure_topic_exists, TopicError, TopicResult};
use crate::model::issue::now_epoch_ms;
use crate::query::execution_error;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const NEXT_SEQ_NO_SQL: &str = "SELECT COALESCE(MAX(seq_no), 0) + 1
FROM topic_messages
WHERE topic = ?1 AND producer_id = ?2;";

const INSERT_MESSAGE_SQL: &str = "INSERT INTO topic_messages
    (topic, producer_id, seq_no, created_at, data)
VALUES (?1, ?2, ?3, ?4, ?5);";

const STORED_MESSAGE_SQL: &str = "SELECT created_at, data
FROM topic_messages
WHERE topic = ?1 AND producer_id = ?2 AND seq_no = ?3;";

#[derive(Debug)]
struct PendingMessage {
    seq_no: i64,
    created_at: i64,
    data: Vec<u8>,
}

/// Writes messages of one producer to one topic.
///
/// Sequence numbers continue from the highest one already stored for the
/// producer. Several writers may share a producer id: when another writer
/// stored a different message under a buffered sequence number, the flush
/// renumbers the rest of the buffer after the stored maximum. A message that
/// is already stored unchanged (a retried flush) is not written twice.
pub struct TopicWriter {
    conn: Connection,
    topic: String,
    producer_id: String,
    next_seq_no: i64,
    max_buffered: usize,
    buffer: Vec<PendingMessage>,
}

impl TopicWriter {
    pub(super) fn open(
        conn: Connection,
        topic: &str,
        producer_id: &str,
        max_buffered: usize,
    ) -> TopicResult<Self> {
        ensure_topic_exists(&conn, topic)?;
        let next_seq_no: i64 =
            conn.query_row(NEXT_SEQ_NO_SQL, params![topic, producer_id], |row| row.get(0))?;

        info!(
            "event=writer_open module=topic status=ok topic={} producer_id={} next_seq_no={}",
            topic, producer_id, next_seq_no
        );
        Ok(Self {
            conn,
            topic: topic.to_string(),
            producer_id: producer_id.to_string(),
            next_seq_no,
            max_buffered: max_buffered.max(1),
            buffer: Vec::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Messages written but not yet stored.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Buffers one message and returns its provisional sequence number.
    ///
    /// The number is final unless another writer with the same producer id
    /// claimed it first. Flushes once the buffer is full; a failed flush keeps the messages
    /// buffered and is reported here.
    pub fn write(&mut self, data: impl Into<Vec<u8>>) -> TopicResult<i64> {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        self.buffer.push(PendingMessage {
            seq_no,
            created_at: now_epoch_ms(),
            data: data.into(),
        });

        if self.buffer.len() >= self.max_buffered {
            self.flush()?;
        }
        Ok(seq_no)
    }

    /// Stores every buffered message in one transaction and returns how many
    /// were flushed.
    pub fn flush(&mut self) -> TopicResult<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        match self.store_buffer() {
            Ok(()) => {
                let flushed = self.buffer.len();
                self.buffer.clear();
                debug!(
                    "event=writer_flush module=topic status=ok topic={} messages={}",
                    self.topic, flushed
                );
                Ok(flushed)
            }
            Err(err) => {
                warn!(
                    "event=writer_flush module=topic status=error topic={} pending={} error={}",
                    self.topic,
                    self.buffer.len(),
                    err
                );
                Err(TopicError::Publish {
                    topic: self.topic.clone(),
                    source: execution_error(err),
                })
            }
        }
    }

    /// Flushes and releases the connection. Buffered messages are lost if
    /// the final flush fails.
    pub fn close(mut self) -> TopicResult<()> {
        self.flush()?;
        self.conn
            .close()
            .map_err(|(_, err)| TopicError::from(err))?;
        info!(
            "event=writer_close module=topic status=ok topic={} producer_id={}",
            self.topic, self.producer_id
        );
        Ok(())
    }

    fn store_buffer(&mut self) -> rusqlite::Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stored_max: i64 = tx.query_row(
            NEXT_SEQ_NO_SQL,
            params![self.topic, self.producer_id],
            |row| row.get::<_, i64>(0),
        )? - 1;

        let mut renumbered = 0;
        {
            let mut lookup = tx.prepare_cached(STORED_MESSAGE_SQL)?;
            let mut insert = tx.prepare_cached(INSERT_MESSAGE_SQL)?;
            for message in &mut self.buffer {
                if message.seq_no <= stored_max {
                    let stored = lookup
                        .query_row(
                            params![self.topic, self.producer_id, message.seq_no],
                            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                        )
                        .optional()?;
                    let already_stored = matches!(
                        &stored,
                        Some((created_at, data))
                            if *created_at == message.created_at && *data == message.data
                    );
                    if already_stored {
                        continue;
                    }
                    stored_max += 1;
                    message.seq_no = stored_max;
                    renumbered += 1;
                }

                insert.execute(params![
                    self.topic,
                    self.producer_id,
                    message.seq_no,
                    message.created_at,
                    message.data
                ])?;
                stored_max = stored_max.max(message.seq_no);
            }
        }
        tx.commit()?;

        self.next_seq_no = self.next_seq_no.max(stored_max + 1);
        if renumbered > 0 {
            warn!(
                "event=writer_renumber module=topic status=ok topic={} producer_id={} renumbered={}",
                self.topic, self.producer_id, renumbered
            );
        }
        Ok(())
    }
}
