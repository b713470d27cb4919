//! Keeps the worker pool alive and heals work abandoned by dead processes.

use crate::errors::{StorageError, SupervisionError};
use crate::processor::MessageProcessor;
use crate::publisher::QueueCache;
use crate::repository::Repository;
use crate::scope::RETRY_FAILED_QUEUE;
use crate::settings::{FailedMessageRecovery, ServerSettings};
use crate::util::{sleep_or_cancelled, time_before};
use crate::worker::Worker;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Owns one worker task per process name.
///
/// Every supervision tick heartbeats live workers, restarts finished ones
/// under the same name, clears processes whose heartbeat went stale and kicks
/// off the failed message recovery sweep.
pub(crate) struct Supervisor<Context> {
    repository: Arc<dyn Repository>,
    processor: Arc<MessageProcessor<Context>>,
    settings: ServerSettings,
    queues: Arc<QueueCache>,
    cancellation: CancellationToken,
    workers: HashMap<String, JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
}

impl<Context: Clone + Send + Sync + 'static> Supervisor<Context> {
    pub(crate) fn new(
        repository: Arc<dyn Repository>,
        processor: Arc<MessageProcessor<Context>>,
        settings: ServerSettings,
        queues: Arc<QueueCache>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            repository,
            processor,
            settings,
            queues,
            cancellation,
            workers: HashMap::new(),
            recovery: None,
        }
    }

    /// Start the workers and supervise them until cancellation is requested.
    pub(crate) async fn run(mut self) {
        let names = (0..self.settings.max_process_count)
            .map(|slot| self.settings.process_name_format.process_name(slot))
            .collect::<Vec<_>>();

        if let Err(error) = self.repository.release_process_lock(&names).await {
            error!("{}", SupervisionError::new("Releasing locks at startup", error));
        }

        for name in names {
            self.spawn_worker(name);
        }

        loop {
            self.supervise().await;

            if !sleep_or_cancelled(self.settings.supervision_interval, &self.cancellation).await {
                break;
            }
        }

        self.shutdown().await;
    }

    fn spawn_worker(&mut self, name: String) {
        info!(worker.name = %name, "Starting worker…");

        let worker = Worker {
            name: name.clone(),
            repository: self.repository.clone(),
            processor: self.processor.clone(),
            check_interval: self.settings.check_interval,
            jitter: self.settings.jitter,
            cancellation: self.cancellation.clone(),
        };

        let span = info_span!("worker", worker.name = %name);
        let handle = tokio::spawn(async move { worker.run().instrument(span).await });

        self.workers.insert(name, handle);
    }

    async fn supervise(&mut self) {
        let mut finished = Vec::new();
        for (name, handle) in &self.workers {
            if handle.is_finished() {
                finished.push(name.clone());
            } else if let Err(error) = self.repository.heartbeat(name).await {
                error!(worker.name = %name, "{}", SupervisionError::new("Heartbeat", error));
            }
        }

        for name in finished {
            if self.cancellation.is_cancelled() {
                break;
            }

            if let Some(handle) = self.workers.remove(&name) {
                if let Err(error) = handle.await {
                    warn!(worker.name = %name, %error, "Worker task panicked");
                }
            }

            if let Err(error) = self
                .repository
                .release_process_lock(std::slice::from_ref(&name))
                .await
            {
                error!(worker.name = %name, "{}", SupervisionError::new("Releasing worker lock", error));
            }

            warn!(worker.name = %name, "Restarting worker");
            self.spawn_worker(name);
        }

        let cutoff = time_before(Utc::now(), self.settings.stale_process_threshold);
        match self.repository.clear_stale_processes(cutoff).await {
            Ok(names) if names.is_empty() => {}
            Ok(names) => warn!("Released stale processes: {}", names.join(", ")),
            Err(error) => error!("{}", SupervisionError::new("Clearing stale processes", error)),
        }

        self.kick_failed_message_recovery();
    }

    fn kick_failed_message_recovery(&mut self) {
        let recovery = self.settings.failed_message_recovery;
        if !recovery.enabled || self.cancellation.is_cancelled() {
            return;
        }
        if self.recovery.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Failed message recovery is still running");
            return;
        }

        let repository = self.repository.clone();
        let queues = self.queues.clone();
        let span = info_span!("failed_message_recovery");
        self.recovery = Some(tokio::spawn(
            async move {
                match recover_failed_messages(repository.as_ref(), &queues, recovery).await {
                    Ok(0) => {}
                    Ok(count) => info!("Moved {count} failed message(s) to {RETRY_FAILED_QUEUE}"),
                    Err(error) => {
                        error!("{}", SupervisionError::new("Failed message recovery", error));
                    }
                }
            }
            .instrument(span),
        ));
    }

    async fn shutdown(self) {
        debug!("Waiting for workers to stop…");

        if let Some(recovery) = self.recovery {
            recovery.abort();
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        for (name, result) in names.iter().zip(join_all(handles).await) {
            if let Err(error) = result {
                warn!(worker.name = %name, %error, "Worker task panicked");
            }
        }
    }
}

/// Move failed messages inside the recovery window back into the retry queue,
/// one page at a time, until a page comes back short.
pub(crate) async fn recover_failed_messages(
    repository: &dyn Repository,
    queues: &QueueCache,
    recovery: FailedMessageRecovery,
) -> Result<u64, StorageError> {
    let now = Utc::now();
    let older_than = time_before(now, recovery.older_than);
    let newer_than = time_before(now, recovery.newer_than);

    let mut moved = 0;
    loop {
        let failed = repository
            .fetch_failed_messages(older_than, newer_than, recovery.batch_size)
            .await?;
        if failed.is_empty() {
            break;
        }

        let queue_id = queues.queue_id(RETRY_FAILED_QUEUE, repository).await?;

        let ids = failed
            .iter()
            .map(|message| message.failed_message_id)
            .collect::<Vec<_>>();
        let count = repository.reenqueue_failed_messages(queue_id, &ids).await?;
        moved += count;

        if count == 0 || failed.len() < recovery.batch_size {
            break;
        }
    }

    Ok(moved)
}
