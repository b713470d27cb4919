//! The storage contract the publisher, workers and supervisor run against.

use crate::errors::StorageError;
use crate::schema::{
    CompletedMessage, DateRange, FailedMessage, MessageDetails, MessageInfo, MessageState,
    MessengerStatus, NewMessage, Page, ProcessStatus, QueueInfo, QueueStatus,
};
use crate::settings::IsolationLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Status of a [`ProcessingTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Statements can still be executed and the transaction committed.
    Active,
    /// The transaction has been committed.
    Committed,
    /// The transaction timed out or a statement failed.
    Aborted,
}

/// Durable storage of queues, messages and worker heartbeats.
///
/// Every method runs in its own transaction unless it takes a
/// [`ProcessingTransaction`].
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Look up a queue id by name.
    async fn fetch_queue_id(&self, name: &str) -> Result<Option<i64>, StorageError>;

    /// Return the id of the queue `name`, creating it if needed.
    async fn create_queue(&self, name: &str) -> Result<i64, StorageError>;

    /// Delete a queue and all of its pending messages.
    async fn delete_queue(&self, queue_id: i64) -> Result<(), StorageError>;

    /// Append a message that becomes eligible after `delay`.
    ///
    /// Returns `None` when the message was deduplicated away.
    async fn create_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError>;

    /// Insert a message ahead of the queue's earliest pending message, then
    /// push its start date back by `delay`.
    async fn insert_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError>;

    /// Delete pending messages with `identity` that are not yet eligible and
    /// drop the identity from the failed archive. Returns the affected rows.
    async fn cancel_messages(&self, identity: Uuid) -> Result<u64, StorageError>;

    /// Delete pending and failed messages with any of the given identities.
    async fn remove_messages(&self, identities: &[Uuid]) -> Result<u64, StorageError>;

    /// Open the transaction that scopes the completion of one message.
    async fn begin_processing(
        &self,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<Box<dyn ProcessingTransaction>, StorageError>;

    /// Claim the queue holding the earliest eligible message.
    async fn lock_queue(&self, process_name: &str) -> Result<Option<QueueInfo>, StorageError>;

    /// Clear the lock and failure streak of a queue.
    async fn release_queue(&self, queue_id: i64) -> Result<(), StorageError>;

    /// Record a failure and release the lock until `next_try_time`.
    async fn set_queue_failure(
        &self,
        queue_id: i64,
        retries: i32,
        error: &str,
        next_try_time: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Up to `count` eligible messages of a queue, oldest first.
    async fn fetch_queue_messages(
        &self,
        queue_id: i64,
        count: usize,
    ) -> Result<Vec<MessageInfo>, StorageError>;

    /// Record that a worker is alive.
    async fn heartbeat(&self, process_name: &str) -> Result<(), StorageError>;

    /// Drop heartbeats older than `older_than` and return their owners.
    async fn clear_stale_processes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError>;

    /// Release every queue locked by one of `process_names`.
    async fn release_process_lock(&self, process_names: &[String]) -> Result<u64, StorageError>;

    /// Delete completed messages archived before `older_than`.
    async fn purge_completed_messages(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Failed messages that failed inside `(newer_than, older_than)`, oldest first.
    async fn fetch_failed_messages(
        &self,
        older_than: DateTime<Utc>,
        newer_than: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<FailedMessage>, StorageError>;

    /// Move failed messages back into `queue_id`, eligible now.
    async fn reenqueue_failed_messages(
        &self,
        queue_id: i64,
        failed_message_ids: &[i64],
    ) -> Result<u64, StorageError>;

    /// Message counts per state.
    async fn get_messenger_status(&self) -> Result<Vec<MessengerStatus>, StorageError>;

    /// Every queue with its pending message count.
    async fn get_queue_statuses(&self) -> Result<Vec<QueueStatus>, StorageError>;

    /// Every worker with a heartbeat.
    async fn get_active_processes(&self) -> Result<Vec<ProcessStatus>, StorageError>;

    /// Pending messages of a queue.
    async fn get_messages(
        &self,
        queue_id: i64,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<MessageDetails>, StorageError>;

    /// Archived completed messages, newest first.
    async fn get_completed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<CompletedMessage>, StorageError>;

    /// Archived failed messages, newest first.
    async fn get_failed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<FailedMessage>, StorageError>;

    /// A pending message by id.
    async fn get_message(&self, message_id: i64) -> Result<Option<MessageDetails>, StorageError>;

    /// A completed message by id.
    async fn get_completed_message(
        &self,
        completed_message_id: i64,
    ) -> Result<Option<CompletedMessage>, StorageError>;

    /// A failed message by id.
    async fn get_failed_message(
        &self,
        failed_message_id: i64,
    ) -> Result<Option<FailedMessage>, StorageError>;

    /// Find a message by identity, looking at pending, completed and failed
    /// messages in that order.
    async fn find_by_identity(&self, identity: Uuid) -> Result<Option<MessageState>, StorageError>;
}

/// A transaction scoping the completion of a single message.
///
/// Dropping it without calling [`ProcessingTransaction::commit`] rolls back
/// every statement made through it.
#[async_trait]
pub trait ProcessingTransaction: Send {
    /// Current status. Becomes [`TransactionStatus::Aborted`] once the
    /// timeout has elapsed or a statement failed.
    fn status(&self) -> TransactionStatus;

    /// Delete a message, copying it to the completed archive if `archive`.
    async fn remove_message(&mut self, message_id: i64, archive: bool)
    -> Result<(), StorageError>;

    /// Copy a message to the failed archive with `error`.
    async fn copy_message_to_failed(
        &mut self,
        message_id: i64,
        error: &str,
    ) -> Result<(), StorageError>;

    /// Move a message behind every other message of its queue.
    async fn move_message_to_end(&mut self, message_id: i64) -> Result<(), StorageError>;

    /// Clear the lock and failure streak of a queue.
    async fn release_queue(&mut self, queue_id: i64) -> Result<(), StorageError>;

    /// Commit every statement made through this transaction.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
