use crate::errors::{StorageError, SupervisionError};
use crate::repository::Repository;
use crate::settings::{CompletedMessages, DEFAULT_CLEANUP_INTERVAL};
use crate::util::sleep_or_cancelled;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically purges the completed message archive.
///
/// Only does anything when completed messages are both archived and
/// configured for cleanup.
pub struct CleanupService {
    repository: Arc<dyn Repository>,
    completed_messages: CompletedMessages,
    interval: Duration,
}

impl std::fmt::Debug for CleanupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupService")
            .field("completed_messages", &self.completed_messages)
            .field("interval", &self.interval)
            .finish()
    }
}

impl CleanupService {
    /// Cleanup service for `repository` with the given retention.
    pub fn new(repository: Arc<dyn Repository>, completed_messages: CompletedMessages) -> Self {
        Self {
            repository,
            completed_messages,
            interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Set how often the archive is purged.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether the retention asks for purging at all.
    pub fn is_enabled(&self) -> bool {
        self.completed_messages.archive && self.completed_messages.cleanup
    }

    /// Purge once, returning the number of deleted archive rows.
    pub async fn cleanup(&self) -> Result<u64, StorageError> {
        let cutoff = self.completed_messages.cutoff(Utc::now());
        debug!("Purging completed messages older than {cutoff}…");
        self.repository.purge_completed_messages(cutoff).await
    }

    /// Purge on every tick until cancellation is requested.
    pub async fn run(self, cancellation: CancellationToken) {
        if !self.is_enabled() {
            debug!("Completed message cleanup is disabled");
            return;
        }

        loop {
            match self.cleanup().await {
                Ok(0) => {}
                Ok(count) => info!("Purged {count} completed message(s)"),
                Err(error) => error!("{}", SupervisionError::new("Completed message cleanup", error)),
            }

            if !sleep_or_cancelled(self.interval, &cancellation).await {
                break;
            }
        }
    }
}
