//! In-process [`Repository`], for tests and for embedding without a database.

use crate::errors::StorageError;
use crate::repository::{ProcessingTransaction, Repository, TransactionStatus};
use crate::schema::{
    CompletedMessage, DateRange, FailedMessage, MessageDetails, MessageInfo, MessageState,
    MessengerStatus, NewMessage, Page, ProcessStatus, QueueInfo, QueueStatus,
};
use crate::settings::IsolationLevel;
use crate::util::time_after;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct QueueRow {
    name: String,
    processing_started: Option<DateTime<Utc>>,
    process_name: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    retries: Option<i32>,
    next_try_time: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl QueueRow {
    fn release(&mut self) {
        self.processing_started = None;
        self.process_name = None;
        self.retries = None;
        self.next_try_time = None;
        self.error = None;
    }
}

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    queues: BTreeMap<i64, QueueRow>,
    messages: BTreeMap<i64, MessageDetails>,
    completed: BTreeMap<i64, CompletedMessage>,
    failed: BTreeMap<i64, FailedMessage>,
    heartbeats: BTreeMap<String, DateTime<Utc>>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn identity_exists(&self, identity: Uuid) -> bool {
        self.messages
            .values()
            .any(|message| message.identity == Some(identity))
    }

    fn insert(&mut self, message: NewMessage, start_date: DateTime<Utc>) -> Option<i64> {
        if message.deduplicate && self.identity_exists(message.identity) {
            return None;
        }

        let message_id = self.next_id();
        self.messages.insert(
            message_id,
            MessageDetails {
                message_id,
                queue_id: message.queue_id,
                content_type: message.content_type,
                content: message.content,
                context: message.context,
                start_date,
                identity: Some(message.identity),
            },
        );
        Some(message_id)
    }

    fn release_process_lock(&mut self, process_names: &[String]) -> u64 {
        let mut released = 0;
        for queue in self.queues.values_mut() {
            let owned = queue
                .process_name
                .as_ref()
                .is_some_and(|name| process_names.contains(name));
            if owned {
                queue.processing_started = None;
                queue.process_name = None;
                queue.next_try_time = None;
                released += 1;
            }
        }
        released
    }

    fn apply(&mut self, operation: Operation, now: DateTime<Utc>) {
        match operation {
            Operation::RemoveMessage {
                message_id,
                archive,
            } => {
                let Some(message) = self.messages.remove(&message_id) else {
                    return;
                };
                if archive {
                    let completed_message_id = self.next_id();
                    self.completed.insert(
                        completed_message_id,
                        CompletedMessage {
                            completed_message_id,
                            content_type: message.content_type,
                            content: message.content,
                            context: message.context,
                            create_date: message.start_date,
                            completed_date: now,
                            identity: message.identity,
                        },
                    );
                }
            }
            Operation::CopyMessageToFailed { message_id, error } => {
                let Some(message) = self.messages.get(&message_id).cloned() else {
                    return;
                };
                let failed_message_id = self.next_id();
                self.failed.insert(
                    failed_message_id,
                    FailedMessage {
                        failed_message_id,
                        content_type: message.content_type,
                        content: message.content,
                        context: message.context,
                        create_date: message.start_date,
                        failed_date: now,
                        error: Some(error),
                        identity: message.identity,
                    },
                );
            }
            Operation::MoveMessageToEnd { message_id } => {
                if let Some(message) = self.messages.get_mut(&message_id) {
                    message.start_date = now;
                }
            }
            Operation::ReleaseQueue { queue_id } => {
                if let Some(queue) = self.queues.get_mut(&queue_id) {
                    queue.release();
                }
            }
        }
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    rows.skip(page.offset()).take(page.limit()).collect()
}

/// Rows dropped between two table sizes.
fn removed(before: usize, after: usize) -> u64 {
    u64::try_from(before.saturating_sub(after)).unwrap_or(u64::MAX)
}

/// [`Repository`] keeping everything in memory.
///
/// Clones share the same storage. Isolation levels are ignored: every
/// operation, and every commit of a processing transaction, is applied
/// atomically under a single lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn fetch_queue_id(&self, name: &str) -> Result<Option<i64>, StorageError> {
        Ok(self
            .state()
            .queues
            .iter()
            .find(|(_, queue)| queue.name == name)
            .map(|(queue_id, _)| *queue_id))
    }

    async fn create_queue(&self, name: &str) -> Result<i64, StorageError> {
        let mut state = self.state();
        if let Some((queue_id, _)) = state.queues.iter().find(|(_, queue)| queue.name == name) {
            return Ok(*queue_id);
        }

        let queue_id = state.next_id();
        state.queues.insert(
            queue_id,
            QueueRow {
                name: name.to_string(),
                ..QueueRow::default()
            },
        );
        Ok(queue_id)
    }

    async fn delete_queue(&self, queue_id: i64) -> Result<(), StorageError> {
        let mut state = self.state();
        state.queues.remove(&queue_id);
        state
            .messages
            .retain(|_, message| message.queue_id != queue_id);
        Ok(())
    }

    async fn create_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError> {
        let mut state = self.state();
        if !state.queues.contains_key(&message.queue_id) {
            return Err(StorageError::NotFound {
                entity: "queue",
                id: message.queue_id,
            });
        }

        Ok(state.insert(message, time_after(Utc::now(), delay)))
    }

    async fn insert_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError> {
        let mut state = self.state();
        if !state.queues.contains_key(&message.queue_id) {
            return Err(StorageError::NotFound {
                entity: "queue",
                id: message.queue_id,
            });
        }

        let start_date = state
            .messages
            .values()
            .filter(|existing| existing.queue_id == message.queue_id)
            .map(|existing| existing.start_date)
            .min()
            .map_or_else(Utc::now, |earliest| {
                earliest - chrono::Duration::microseconds(1)
            });
        Ok(state.insert(message, time_after(start_date, delay)))
    }

    async fn cancel_messages(&self, identity: Uuid) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut state = self.state();

        let before = state.messages.len() + state.failed.len();
        state
            .messages
            .retain(|_, message| message.identity != Some(identity) || message.start_date <= now);
        state
            .failed
            .retain(|_, message| message.identity != Some(identity));
        let after = state.messages.len() + state.failed.len();

        Ok(removed(before, after))
    }

    async fn remove_messages(&self, identities: &[Uuid]) -> Result<u64, StorageError> {
        let matches = |identity: &Option<Uuid>| identity.is_some_and(|id| identities.contains(&id));
        let mut state = self.state();

        let before = state.messages.len() + state.failed.len();
        state.messages.retain(|_, message| !matches(&message.identity));
        state.failed.retain(|_, message| !matches(&message.identity));
        let after = state.messages.len() + state.failed.len();

        Ok(removed(before, after))
    }

    async fn begin_processing(
        &self,
        _isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<Box<dyn ProcessingTransaction>, StorageError> {
        Ok(Box::new(MemoryProcessingTransaction {
            state: self.state.clone(),
            operations: Vec::new(),
            deadline: Instant::now() + timeout,
            committed: false,
        }))
    }

    async fn lock_queue(&self, process_name: &str) -> Result<Option<QueueInfo>, StorageError> {
        let now = Utc::now();
        let mut state = self.state();

        let candidate = state
            .messages
            .values()
            .filter(|message| message.start_date <= now)
            .filter(|message| {
                state.queues.get(&message.queue_id).is_some_and(|queue| {
                    queue.processing_started.is_none()
                        && queue.next_try_time.is_none_or(|next| next < now)
                })
            })
            .min_by_key(|message| (message.start_date, message.message_id))
            .map(|message| message.queue_id);

        let Some(queue_id) = candidate else {
            return Ok(None);
        };
        let Some(queue) = state.queues.get_mut(&queue_id) else {
            return Ok(None);
        };

        queue.processing_started = Some(now);
        queue.process_name = Some(process_name.to_string());
        queue.processed_at = Some(now);

        Ok(Some(QueueInfo {
            queue_id,
            name: queue.name.clone(),
            retries: queue.retries,
        }))
    }

    async fn release_queue(&self, queue_id: i64) -> Result<(), StorageError> {
        if let Some(queue) = self.state().queues.get_mut(&queue_id) {
            queue.release();
        }
        Ok(())
    }

    async fn set_queue_failure(
        &self,
        queue_id: i64,
        retries: i32,
        error: &str,
        next_try_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if let Some(queue) = self.state().queues.get_mut(&queue_id) {
            queue.processing_started = None;
            queue.process_name = None;
            queue.retries = Some(retries);
            queue.error = Some(error.to_string());
            queue.next_try_time = Some(next_try_time);
        }
        Ok(())
    }

    async fn fetch_queue_messages(
        &self,
        queue_id: i64,
        count: usize,
    ) -> Result<Vec<MessageInfo>, StorageError> {
        let now = Utc::now();
        let state = self.state();

        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|message| message.queue_id == queue_id && message.start_date <= now)
            .collect();
        messages.sort_by_key(|message| (message.start_date, message.message_id));

        Ok(messages
            .into_iter()
            .take(count)
            .map(|message| MessageInfo {
                message_id: message.message_id,
                content_type: message.content_type.clone(),
                content: message.content.clone(),
                context: message.context.clone(),
                start_date: message.start_date,
                identity: message.identity,
            })
            .collect())
    }

    async fn heartbeat(&self, process_name: &str) -> Result<(), StorageError> {
        self.state()
            .heartbeats
            .insert(process_name.to_string(), Utc::now());
        Ok(())
    }

    async fn clear_stale_processes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let mut state = self.state();

        let stale: Vec<String> = state
            .heartbeats
            .iter()
            .filter(|(_, last_beat)| **last_beat < older_than)
            .map(|(process_name, _)| process_name.clone())
            .collect();

        for process_name in &stale {
            state.heartbeats.remove(process_name);
        }
        state.release_process_lock(&stale);

        Ok(stale)
    }

    async fn release_process_lock(&self, process_names: &[String]) -> Result<u64, StorageError> {
        Ok(self.state().release_process_lock(process_names))
    }

    async fn purge_completed_messages(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let mut state = self.state();
        let before = state.completed.len();
        state
            .completed
            .retain(|_, message| message.completed_date >= older_than);
        Ok(removed(before, state.completed.len()))
    }

    async fn fetch_failed_messages(
        &self,
        older_than: DateTime<Utc>,
        newer_than: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<FailedMessage>, StorageError> {
        let state = self.state();
        let mut messages: Vec<_> = state
            .failed
            .values()
            .filter(|message| message.failed_date < older_than && message.failed_date > newer_than)
            .cloned()
            .collect();
        messages.sort_by_key(|message| (message.failed_date, message.failed_message_id));
        messages.truncate(count);
        Ok(messages)
    }

    async fn reenqueue_failed_messages(
        &self,
        queue_id: i64,
        failed_message_ids: &[i64],
    ) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut state = self.state();
        if !state.queues.contains_key(&queue_id) {
            return Err(StorageError::NotFound {
                entity: "queue",
                id: queue_id,
            });
        }

        let mut ids = failed_message_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut moved = 0;
        for failed_message_id in ids {
            let Some(failed) = state.failed.remove(&failed_message_id) else {
                continue;
            };
            let message_id = state.next_id();
            state.messages.insert(
                message_id,
                MessageDetails {
                    message_id,
                    queue_id,
                    content_type: failed.content_type,
                    content: failed.content,
                    context: failed.context,
                    start_date: now,
                    identity: failed.identity,
                },
            );
            moved += 1;
        }

        Ok(moved)
    }

    async fn get_messenger_status(&self) -> Result<Vec<MessengerStatus>, StorageError> {
        let state = self.state();
        let count = |status: &str, count: usize| MessengerStatus {
            status: status.to_string(),
            message_count: i64::try_from(count).unwrap_or(i64::MAX),
        };

        Ok(vec![
            count("Ready", state.messages.len()),
            count("Completed", state.completed.len()),
            count("Failed", state.failed.len()),
        ])
    }

    async fn get_queue_statuses(&self) -> Result<Vec<QueueStatus>, StorageError> {
        let state = self.state();
        let mut queues: Vec<_> = state
            .queues
            .iter()
            .map(|(queue_id, queue)| QueueStatus {
                queue_id: *queue_id,
                name: queue.name.clone(),
                processed_at: queue.processed_at,
                processing_started: queue.processing_started,
                process_name: queue.process_name.clone(),
                retries: queue.retries,
                next_try_time: queue.next_try_time,
                error: queue.error.clone(),
                message_count: i64::try_from(
                    state
                        .messages
                        .values()
                        .filter(|message| message.queue_id == *queue_id)
                        .count(),
                )
                .unwrap_or(i64::MAX),
            })
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn get_active_processes(&self) -> Result<Vec<ProcessStatus>, StorageError> {
        Ok(self
            .state()
            .heartbeats
            .iter()
            .map(|(process_name, last_beat)| ProcessStatus {
                process_name: process_name.clone(),
                last_beat: *last_beat,
            })
            .collect())
    }

    async fn get_messages(
        &self,
        queue_id: i64,
        page_of: Page,
        range: DateRange,
    ) -> Result<Vec<MessageDetails>, StorageError> {
        let state = self.state();
        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|message| message.queue_id == queue_id && range.contains(message.start_date))
            .collect();
        messages.sort_by_key(|message| (message.start_date, message.message_id));
        Ok(page(messages.into_iter().cloned(), page_of))
    }

    async fn get_completed_messages(
        &self,
        page_of: Page,
        range: DateRange,
    ) -> Result<Vec<CompletedMessage>, StorageError> {
        let state = self.state();
        let mut messages: Vec<_> = state
            .completed
            .values()
            .filter(|message| range.contains(message.completed_date))
            .collect();
        messages.sort_by_key(|message| {
            std::cmp::Reverse((message.completed_date, message.completed_message_id))
        });
        Ok(page(messages.into_iter().cloned(), page_of))
    }

    async fn get_failed_messages(
        &self,
        page_of: Page,
        range: DateRange,
    ) -> Result<Vec<FailedMessage>, StorageError> {
        let state = self.state();
        let mut messages: Vec<_> = state
            .failed
            .values()
            .filter(|message| range.contains(message.failed_date))
            .collect();
        messages.sort_by_key(|message| {
            std::cmp::Reverse((message.failed_date, message.failed_message_id))
        });
        Ok(page(messages.into_iter().cloned(), page_of))
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<MessageDetails>, StorageError> {
        Ok(self.state().messages.get(&message_id).cloned())
    }

    async fn get_completed_message(
        &self,
        completed_message_id: i64,
    ) -> Result<Option<CompletedMessage>, StorageError> {
        Ok(self.state().completed.get(&completed_message_id).cloned())
    }

    async fn get_failed_message(
        &self,
        failed_message_id: i64,
    ) -> Result<Option<FailedMessage>, StorageError> {
        Ok(self.state().failed.get(&failed_message_id).cloned())
    }

    async fn find_by_identity(&self, identity: Uuid) -> Result<Option<MessageState>, StorageError> {
        let state = self.state();
        let identity = Some(identity);

        if let Some(message) = state.messages.values().find(|m| m.identity == identity) {
            return Ok(Some(MessageState::Ready(message.clone())));
        }
        if let Some(message) = state
            .completed
            .values()
            .rev()
            .find(|m| m.identity == identity)
        {
            return Ok(Some(MessageState::Completed(message.clone())));
        }
        Ok(state
            .failed
            .values()
            .rev()
            .find(|m| m.identity == identity)
            .cloned()
            .map(MessageState::Failed))
    }
}

#[derive(Debug)]
enum Operation {
    RemoveMessage { message_id: i64, archive: bool },
    CopyMessageToFailed { message_id: i64, error: String },
    MoveMessageToEnd { message_id: i64 },
    ReleaseQueue { queue_id: i64 },
}

/// Buffers statements and applies them atomically on commit.
struct MemoryProcessingTransaction {
    state: Arc<Mutex<State>>,
    operations: Vec<Operation>,
    deadline: Instant,
    committed: bool,
}

impl MemoryProcessingTransaction {
    fn push(&mut self, operation: Operation) -> Result<(), StorageError> {
        match self.status() {
            TransactionStatus::Active => {
                self.operations.push(operation);
                Ok(())
            }
            status => Err(StorageError::TransactionClosed(status)),
        }
    }
}

#[async_trait]
impl ProcessingTransaction for MemoryProcessingTransaction {
    fn status(&self) -> TransactionStatus {
        if self.committed {
            TransactionStatus::Committed
        } else if Instant::now() >= self.deadline {
            TransactionStatus::Aborted
        } else {
            TransactionStatus::Active
        }
    }

    async fn remove_message(
        &mut self,
        message_id: i64,
        archive: bool,
    ) -> Result<(), StorageError> {
        self.push(Operation::RemoveMessage {
            message_id,
            archive,
        })
    }

    async fn copy_message_to_failed(
        &mut self,
        message_id: i64,
        error: &str,
    ) -> Result<(), StorageError> {
        self.push(Operation::CopyMessageToFailed {
            message_id,
            error: error.to_string(),
        })
    }

    async fn move_message_to_end(&mut self, message_id: i64) -> Result<(), StorageError> {
        self.push(Operation::MoveMessageToEnd { message_id })
    }

    async fn release_queue(&mut self, queue_id: i64) -> Result<(), StorageError> {
        self.push(Operation::ReleaseQueue { queue_id })
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.status() {
            TransactionStatus::Active => {}
            status => return Err(StorageError::TransactionClosed(status)),
        }

        let now = Utc::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for operation in self.operations.drain(..) {
            state.apply(operation, now);
        }
        drop(state);

        self.committed = true;
        Ok(())
    }
}
