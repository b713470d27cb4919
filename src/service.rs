//! Administrative queries and operations for operators and dashboards.

use crate::errors::StorageError;
use crate::publisher::QueueCache;
use crate::repository::Repository;
use crate::schema::{
    CompletedMessage, DateRange, FailedMessage, MessageDetails, MessageState, MessengerStatus,
    Page, ProcessStatus, QueueStatus,
};
use crate::scope::RETRY_FAILED_QUEUE;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

const REENQUEUE_BATCH_SIZE: usize = 100;

/// Read access to queues and archives, plus the operator actions.
#[derive(Clone)]
pub struct MessengerService {
    repository: Arc<dyn Repository>,
    queues: Arc<QueueCache>,
}

impl std::fmt::Debug for MessengerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerService").finish_non_exhaustive()
    }
}

impl MessengerService {
    /// Service over `repository`.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            queues: Arc::new(QueueCache::new()),
        }
    }

    /// Share a queue cache with messengers of the same process.
    pub fn with_queue_cache(mut self, queues: Arc<QueueCache>) -> Self {
        self.queues = queues;
        self
    }

    /// Message counts for `Ready`, `Completed` and `Failed`.
    pub async fn status(&self) -> Result<Vec<MessengerStatus>, StorageError> {
        self.repository.get_messenger_status().await
    }

    /// Every queue with its lock, failure state and pending message count.
    pub async fn queue_statuses(&self) -> Result<Vec<QueueStatus>, StorageError> {
        self.repository.get_queue_statuses().await
    }

    /// Workers that have sent a heartbeat.
    pub async fn active_processes(&self) -> Result<Vec<ProcessStatus>, StorageError> {
        self.repository.get_active_processes().await
    }

    /// Pending messages of a queue, in execution order.
    pub async fn messages(
        &self,
        queue_id: i64,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<MessageDetails>, StorageError> {
        self.repository.get_messages(queue_id, page, range).await
    }

    /// Completed archive, newest first.
    pub async fn completed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<CompletedMessage>, StorageError> {
        self.repository.get_completed_messages(page, range).await
    }

    /// Failed archive, newest first.
    pub async fn failed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<FailedMessage>, StorageError> {
        self.repository.get_failed_messages(page, range).await
    }

    /// A pending message by id.
    pub async fn message(&self, message_id: i64) -> Result<Option<MessageDetails>, StorageError> {
        self.repository.get_message(message_id).await
    }

    /// A completed message by archive id.
    pub async fn completed_message(
        &self,
        completed_message_id: i64,
    ) -> Result<Option<CompletedMessage>, StorageError> {
        self.repository
            .get_completed_message(completed_message_id)
            .await
    }

    /// A failed message by archive id.
    pub async fn failed_message(
        &self,
        failed_message_id: i64,
    ) -> Result<Option<FailedMessage>, StorageError> {
        self.repository.get_failed_message(failed_message_id).await
    }

    /// Where the message with `identity` currently is.
    pub async fn find_by_identity(
        &self,
        identity: Uuid,
    ) -> Result<Option<MessageState>, StorageError> {
        self.repository.find_by_identity(identity).await
    }

    /// Delete pending and failed messages with any of `identities`.
    #[instrument(name = "messenger.remove_messages", skip_all, fields(count = identities.len()))]
    pub async fn remove_messages(&self, identities: &[Uuid]) -> Result<u64, StorageError> {
        let removed = self.repository.remove_messages(identities).await?;
        info!("Removed {removed} message(s)");
        Ok(removed)
    }

    /// Move every failed message into `queue_name`, or the retry queue.
    #[instrument(name = "messenger.reenqueue_all_failed", skip(self))]
    pub async fn reenqueue_all_failed(&self, queue_name: Option<&str>) -> Result<u64, StorageError> {
        let queue_id = self.target_queue(queue_name).await?;
        let older_than = Utc::now() + chrono::Duration::days(1);

        let mut moved = 0;
        loop {
            let failed = self
                .repository
                .fetch_failed_messages(older_than, DateTime::UNIX_EPOCH, REENQUEUE_BATCH_SIZE)
                .await?;
            if failed.is_empty() {
                break;
            }

            let ids = failed
                .iter()
                .map(|message| message.failed_message_id)
                .collect::<Vec<_>>();
            let count = self
                .repository
                .reenqueue_failed_messages(queue_id, &ids)
                .await?;
            moved += count;

            if count == 0 || failed.len() < REENQUEUE_BATCH_SIZE {
                break;
            }
        }

        info!("Re-enqueued {moved} failed message(s)");
        Ok(moved)
    }

    /// Move the failed messages with any of `identities` into `queue_name`,
    /// or the retry queue. Identities that are not failed are skipped.
    #[instrument(name = "messenger.reenqueue_failed", skip(self, identities), fields(count = identities.len()))]
    pub async fn reenqueue_failed(
        &self,
        identities: &[Uuid],
        queue_name: Option<&str>,
    ) -> Result<u64, StorageError> {
        let mut ids = Vec::new();
        for identity in identities {
            if let Some(MessageState::Failed(message)) =
                self.repository.find_by_identity(*identity).await?
            {
                ids.push(message.failed_message_id);
            }
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let queue_id = self.target_queue(queue_name).await?;
        let moved = self
            .repository
            .reenqueue_failed_messages(queue_id, &ids)
            .await?;
        info!("Re-enqueued {moved} failed message(s)");
        Ok(moved)
    }

    /// Release the queues held by `process_names`.
    #[instrument(name = "messenger.release_process_lock", skip(self))]
    pub async fn release_process_lock(&self, process_names: &[String]) -> Result<u64, StorageError> {
        self.repository.release_process_lock(process_names).await
    }

    /// Delete the queue `name` together with its pending messages.
    ///
    /// Returns `false` when no such queue exists. Messengers sharing this
    /// service's queue cache recreate the queue on their next publish.
    #[instrument(name = "messenger.delete_queue", skip(self))]
    pub async fn delete_queue(&self, name: &str) -> Result<bool, StorageError> {
        let Some(queue_id) = self.repository.fetch_queue_id(name).await? else {
            self.queues.invalidate(name).await;
            return Ok(false);
        };

        self.repository.delete_queue(queue_id).await?;
        self.queues.invalidate(name).await;
        info!(queue.id = queue_id, "Deleted queue {name}");
        Ok(true)
    }

    async fn target_queue(&self, queue_name: Option<&str>) -> Result<i64, StorageError> {
        let queue_name = queue_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(RETRY_FAILED_QUEUE);
        self.queues
            .queue_id(queue_name, self.repository.as_ref())
            .await
    }
}
