use crate::cleaner::CleanupService;
use crate::executor::JobExecutor;
use crate::job_registry::JobRegistry;
use crate::processor::MessageProcessor;
use crate::publisher::{Messenger, QueueCache};
use crate::repository::Repository;
use crate::serializer::JsonSerializer;
use crate::service::MessengerService;
use crate::settings::{CompletedMessages, FailedMessageRecovery, ProcessNameFormat, ServerSettings};
use crate::supervisor::Supervisor;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Runs the worker pool, its supervisor and the archive cleanup.
pub struct Server<Context: Clone + Send + Sync + 'static> {
    repository: Arc<dyn Repository>,
    executor: JobExecutor<Context>,
    context: Context,
    settings: ServerSettings,
    queues: Arc<QueueCache>,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug for Server<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("context", &self.context)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Server<Context> {
    /// Create a new server running the jobs of `registry` with the given context.
    pub fn new(
        repository: Arc<dyn Repository>,
        registry: Arc<JobRegistry<Context>>,
        context: Context,
    ) -> Self {
        Self {
            repository,
            executor: JobExecutor::new(registry, Arc::new(JsonSerializer)),
            context,
            settings: ServerSettings::default(),
            queues: Arc::new(QueueCache::new()),
        }
    }

    /// Use an executor with a custom serializer or activator.
    pub fn with_executor(mut self, executor: JobExecutor<Context>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace all settings at once, for example with settings loaded from a file.
    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set how long an idle worker waits before polling again.
    pub fn check_interval(mut self, check_interval: Duration) -> Self {
        self.settings.check_interval = check_interval;
        self
    }

    /// Set the maximum random jitter to add to check intervals.
    ///
    /// Jitter helps reduce thundering herd effects when many workers poll
    /// at the same time. The actual jitter applied is a random value between
    /// 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.settings.jitter = jitter;
        self
    }

    /// Set the number of workers.
    pub fn max_process_count(mut self, count: usize) -> Self {
        self.settings.max_process_count = count;
        self
    }

    /// Set how many messages a worker processes per queue lock.
    pub fn message_batch_size(mut self, size: usize) -> Self {
        self.settings.message_batch_size = size;
        self
    }

    /// Set how worker process names are built.
    pub fn process_name_format(mut self, format: ProcessNameFormat) -> Self {
        self.settings.process_name_format = format;
        self
    }

    /// Set the retention of completed messages.
    pub fn completed_messages(mut self, completed_messages: CompletedMessages) -> Self {
        self.settings.completed_messages = completed_messages;
        self
    }

    /// Configure the failed message recovery sweep.
    pub fn failed_message_recovery(mut self, recovery: FailedMessageRecovery) -> Self {
        self.settings.failed_message_recovery = recovery;
        self
    }

    /// Set the cadence of heartbeats and worker restarts.
    pub fn supervision_interval(mut self, interval: Duration) -> Self {
        self.settings.supervision_interval = interval;
        self
    }

    /// Set the heartbeat age after which a process is considered dead.
    pub fn stale_process_threshold(mut self, threshold: Duration) -> Self {
        self.settings.stale_process_threshold = threshold;
        self
    }

    /// Set the cadence of the completed archive purge.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.settings.cleanup_interval = interval;
        self
    }

    /// Set the delay before a failing queue is retried.
    pub fn failure_backoff(mut self, backoff: Duration) -> Self {
        self.settings.failure_backoff = backoff;
        self
    }

    /// The effective settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// A messenger publishing through this server's repository and executor.
    pub fn messenger(&self) -> Messenger<Context> {
        Messenger::new(self.repository.clone(), self.executor.registry_arc().clone())
            .with_executor(self.executor.clone())
            .with_queue_cache(self.queues.clone())
    }

    /// The administrative service over this server's repository.
    pub fn service(&self) -> MessengerService {
        MessengerService::new(self.repository.clone()).with_queue_cache(self.queues.clone())
    }

    /// Start the workers, the supervisor and the cleanup service.
    ///
    /// This returns a `ServerHandle` which can be used to stop the server and
    /// wait for its tasks to finish.
    pub fn start(&self) -> ServerHandle {
        let cancellation = CancellationToken::new();

        let processor = MessageProcessor::new(
            self.repository.clone(),
            self.executor.clone(),
            self.context.clone(),
        )
        .batch_size(self.settings.message_batch_size)
        .archive_completed(self.settings.completed_messages.archive)
        .failure_backoff(self.settings.failure_backoff);

        info!(
            workers = self.settings.max_process_count,
            "Starting messenger server…"
        );

        let supervisor = Supervisor::new(
            self.repository.clone(),
            Arc::new(processor),
            self.settings.clone(),
            self.queues.clone(),
            cancellation.clone(),
        );
        let span = info_span!("supervisor");
        let supervisor = tokio::spawn(supervisor.run().instrument(span));

        let cleaner = CleanupService::new(self.repository.clone(), self.settings.completed_messages)
            .interval(self.settings.cleanup_interval);
        let span = info_span!("cleaner");
        let cleaner = tokio::spawn(cleaner.run(cancellation.clone()).instrument(span));

        ServerHandle {
            cancellation,
            handles: vec![supervisor, cleaner],
        }
    }
}

/// Handle to a running server.
#[derive(Debug)]
pub struct ServerHandle {
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Token that is cancelled when the server shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Ask every task to stop.
    ///
    /// Workers finish the message they are running and release their queue.
    /// Jobs observe the request through their [`JobContext`](crate::JobContext).
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Wait for all tasks to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Messenger task panicked");
            }
        });
    }

    /// Stop the server and wait for it.
    pub async fn stop(self) {
        self.shutdown();
        self.wait_for_shutdown().await;
    }
}
