//! Background change log workers.
//!
//! A worker loops `read -> handle -> commit` on its own tokio task until its
//! cancellation token fires. A failed handle or commit rewinds the channel
//! to the last committed offset, so the message is delivered again after
//! `retry_delay` (at-least-once).

use super::decode::{ChangeRecord, StatusEvent};
use super::{Message, TopicError, TopicResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of messages for a worker.
#[async_trait]
pub trait MessageChannel: Send + 'static {
    /// Waits for the next message; fails with `Cancelled` once `cancel` fires.
    async fn read(&mut self, cancel: &CancellationToken) -> TopicResult<Message>;
    fn commit(&mut self, message: &Message) -> TopicResult<()>;
    /// Makes the next `read` resume after the last committed message.
    fn rewind(&mut self);
    fn close(self) -> TopicResult<()>
    where
        Self: Sized;
}

/// Processing step run for every delivered message.
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, message: &Message) -> TopicResult<()>;
}

/// Decodes status notifications and forwards them to `events`.
pub struct StatusEventHandler {
    events: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusEventHandler {
    pub fn new(events: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { events }
    }
}

impl MessageHandler for StatusEventHandler {
    fn handle(&mut self, message: &Message) -> TopicResult<()> {
        let event = StatusEvent::decode(message.text()?)?;
        info!(
            "event=status_received module=topic status=ok offset={} issue_id={} issue_status={}",
            message.offset, event.id, event.status
        );
        if self.events.send(event).is_err() {
            debug!("event=status_forward module=topic status=skipped reason=receiver_dropped");
        }
        Ok(())
    }
}

/// Decodes changefeed records and forwards them to `events`.
pub struct ChangefeedHandler {
    events: mpsc::UnboundedSender<ChangeRecord>,
}

impl ChangefeedHandler {
    pub fn new(events: mpsc::UnboundedSender<ChangeRecord>) -> Self {
        Self { events }
    }
}

impl MessageHandler for ChangefeedHandler {
    fn handle(&mut self, message: &Message) -> TopicResult<()> {
        let record = ChangeRecord::decode(&message.data)?;
        info!(
            "event=change_received module=topic status=ok offset={} kind={:?} issue_id={}",
            message.offset,
            record.kind(),
            record
                .id()
                .map_or_else(|| "none".to_string(), |id| id.to_string())
        );
        if self.events.send(record).is_err() {
            debug!("event=change_forward module=topic status=skipped reason=receiver_dropped");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reading,
    Processing,
    Committing,
    Draining,
    Closed,
}

/// Handle to a running worker task.
pub struct ChangeLogWorker {
    name: String,
    token: CancellationToken,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<TopicResult<()>>,
}

impl ChangeLogWorker {
    /// Spawns the worker loop on the current tokio runtime.
    ///
    /// The worker stops when `parent` or its own token is cancelled.
    pub fn start<C, H>(
        name: impl Into<String>,
        channel: C,
        handler: H,
        parent: &CancellationToken,
        retry_delay: Duration,
    ) -> Self
    where
        C: MessageChannel,
        H: MessageHandler,
    {
        let name = name.into();
        let token = parent.child_token();
        let (state_tx, state) = watch::channel(WorkerState::Idle);

        let task = tokio::spawn(run_worker(
            name.clone(),
            channel,
            handler,
            token.clone(),
            state_tx,
            retry_delay,
        ));
        info!("event=worker_start module=topic status=ok worker={}", name);

        Self {
            name,
            token,
            state,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that keeps observing state changes after `shutdown`.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the worker, waits for the in-flight message to finish and
    /// returns the result of closing the channel.
    pub async fn shutdown(self) -> TopicResult<()> {
        self.token.cancel();
        let result = match self.task.await {
            Ok(result) => result,
            Err(err) => Err(TopicError::WorkerPanicked(err.to_string())),
        };
        match &result {
            Ok(()) => info!(
                "event=worker_shutdown module=topic status=ok worker={}",
                self.name
            ),
            Err(err) => warn!(
                "event=worker_shutdown module=topic status=error worker={} error={}",
                self.name, err
            ),
        }
        result
    }
}

async fn run_worker<C, H>(
    name: String,
    mut channel: C,
    mut handler: H,
    token: CancellationToken,
    state: watch::Sender<WorkerState>,
    retry_delay: Duration,
) -> TopicResult<()>
where
    C: MessageChannel,
    H: MessageHandler,
{
    loop {
        state.send_replace(WorkerState::Reading);
        let message = match channel.read(&token).await {
            Ok(message) => message,
            Err(TopicError::Cancelled) if token.is_cancelled() => break,
            Err(err) => {
                warn!(
                    "event=worker_read module=topic status=error worker={} error={}",
                    name, err
                );
                channel.rewind();
                if wait_or_cancelled(&token, retry_delay).await {
                    break;
                }
                continue;
            }
        };

        state.send_replace(WorkerState::Processing);
        if let Err(err) = handler.handle(&message) {
            warn!(
                "event=worker_handle module=topic status=error worker={} offset={} error={}",
                name, message.offset, err
            );
            channel.rewind();
            if wait_or_cancelled(&token, retry_delay).await {
                break;
            }
            continue;
        }

        state.send_replace(WorkerState::Committing);
        if let Err(err) = channel.commit(&message) {
            warn!(
                "event=worker_commit module=topic status=error worker={} offset={} error={}",
                name, message.offset, err
            );
            channel.rewind();
            if wait_or_cancelled(&token, retry_delay).await {
                break;
            }
        }
    }

    state.send_replace(WorkerState::Draining);
    let result = channel.close();
    state.send_replace(WorkerState::Closed);
    result
}

/// Sleeps for `delay`; returns `true` if cancelled first.
async fn wait_or_cancelled(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeLogWorker, MessageChannel, MessageHandler, WorkerState};
    use crate::topic::{Message, TopicError, TopicResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Journal {
        committed: Vec<i64>,
        rewinds: usize,
        closed: bool,
    }

    struct ScriptedChannel {
        all: Vec<Message>,
        queue: VecDeque<Message>,
        committed: i64,
        journal: Arc<Mutex<Journal>>,
    }

    impl ScriptedChannel {
        fn new(offsets: &[i64], journal: Arc<Mutex<Journal>>) -> Self {
            let all: Vec<Message> = offsets
                .iter()
                .map(|offset| Message {
                    topic: "t".to_string(),
                    offset: *offset,
                    seq_no: *offset,
                    producer_id: "p".to_string(),
                    created_at: 0,
                    data: Vec::new(),
                })
                .collect();
            Self {
                queue: all.iter().cloned().collect(),
                all,
                committed: 0,
                journal,
            }
        }
    }

    #[async_trait]
    impl MessageChannel for ScriptedChannel {
        async fn read(&mut self, cancel: &CancellationToken) -> TopicResult<Message> {
            match self.queue.pop_front() {
                Some(message) => Ok(message),
                None => {
                    cancel.cancelled().await;
                    Err(TopicError::Cancelled)
                }
            }
        }

        fn commit(&mut self, message: &Message) -> TopicResult<()> {
            self.committed = message.offset;
            self.journal.lock().unwrap().committed.push(message.offset);
            Ok(())
        }

        fn rewind(&mut self) {
            let committed = self.committed;
            self.queue = self
                .all
                .iter()
                .filter(|message| message.offset > committed)
                .cloned()
                .collect();
            self.journal.lock().unwrap().rewinds += 1;
        }

        fn close(self) -> TopicResult<()> {
            self.journal.lock().unwrap().closed = true;
            Ok(())
        }
    }

    /// Fails the first attempt at every offset in `fail_once`.
    struct FlakyHandler {
        fail_once: Vec<i64>,
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl MessageHandler for FlakyHandler {
        fn handle(&mut self, message: &Message) -> TopicResult<()> {
            self.seen.lock().unwrap().push(message.offset);
            if let Some(index) = self.fail_once.iter().position(|o| *o == message.offset) {
                self.fail_once.remove(index);
                return Err(TopicError::Decode("transient".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_message_is_redelivered_before_later_ones_commit() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let root = CancellationToken::new();
        let worker = ChangeLogWorker::start(
            "scripted",
            ScriptedChannel::new(&[1, 2, 3], journal.clone()),
            FlakyHandler {
                fail_once: vec![2],
                seen: seen.clone(),
            },
            &root,
            Duration::from_millis(5),
        );

        for _ in 0..200 {
            if journal.lock().unwrap().committed.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut states = worker.subscribe_state();
        worker.shutdown().await.unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.committed, vec![1, 2, 3]);
        assert_eq!(journal.rewinds, 1);
        assert!(journal.closed);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 2, 3]);
        assert_eq!(*states.borrow_and_update(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_worker() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let root = CancellationToken::new();
        let worker = ChangeLogWorker::start(
            "idle",
            ScriptedChannel::new(&[], journal.clone()),
            FlakyHandler {
                fail_once: Vec::new(),
                seen: Arc::new(Mutex::new(Vec::new())),
            },
            &root,
            Duration::from_millis(5),
        );

        root.cancel();
        assert!(worker.cancellation_token().is_cancelled());
        worker.shutdown().await.unwrap();
        assert!(journal.lock().unwrap().closed);
    }
}
