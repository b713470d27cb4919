use crate::errors::StorageError;
use crate::processor::{MessageProcessor, QueueDecision};
use crate::repository::Repository;
use crate::util::{jittered, sleep_or_cancelled};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// A long-running loop that locks one queue at a time under its process name.
pub(crate) struct Worker<Context> {
    pub(crate) name: String,
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) processor: Arc<MessageProcessor<Context>>,
    pub(crate) check_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) cancellation: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Process queues until cancellation is requested.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        // A previous run under the same name may have died holding a queue.
        self.release_lock().await;

        while !self.cancellation.is_cancelled() {
            let idle = match self.run_next_queue().await {
                Ok(Some(_)) => false,
                Ok(None) => {
                    trace!("No queue available. Polling again shortly…");
                    true
                }
                Err(error) => {
                    error!("Failed to process queue: {error}");
                    true
                }
            };

            if idle {
                let delay = jittered(self.check_interval, self.jitter);
                if !sleep_or_cancelled(delay, &self.cancellation).await {
                    break;
                }
                self.release_lock().await;
            }
        }

        debug!("Worker stopped");
    }

    /// Lock the next eligible queue and process one batch of it.
    ///
    /// Returns:
    /// - `Ok(Some(decision))` if a queue was processed
    /// - `Ok(None)` if no queue was eligible
    /// - `Err(...)` if a storage call failed
    async fn run_next_queue(&self) -> Result<Option<QueueDecision>, StorageError> {
        trace!("Looking for the next queue…");

        let Some(queue) = self.repository.lock_queue(&self.name).await? else {
            return Ok(None);
        };

        let span = info_span!("queue", queue.id = queue.queue_id, queue.name = %queue.name);
        let decision = self
            .processor
            .run(&queue, &self.cancellation)
            .instrument(span)
            .await?;

        Ok(Some(decision))
    }

    async fn release_lock(&self) {
        if let Err(error) = self
            .repository
            .release_process_lock(std::slice::from_ref(&self.name))
            .await
        {
            warn!("Failed to release queue lock: {error}");
        }
    }
}
