use crate::errors::{JobError, PublishError, StorageError};
use crate::executor::JobExecutor;
use crate::job::{JobCall, JobKind};
use crate::job_registry::JobRegistry;
use crate::repository::Repository;
use crate::schema::NewMessage;
use crate::scope::{QueueScope, QueueTarget};
use crate::serializer::{JsonSerializer, Serializer};
use crate::settings::{MessageContext, PublishSettings};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{instrument, trace};
use uuid::Uuid;

type DefaultQueueName = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Queue name to id cache.
///
/// Lookups that miss fetch or create the queue while holding the cache lock,
/// so concurrent first publishes to a name create a single row.
#[derive(Debug, Default)]
pub struct QueueCache {
    ids: Mutex<HashMap<String, i64>>,
}

impl QueueCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the queue `name`, creating the queue on first use.
    pub async fn queue_id(
        &self,
        name: &str,
        repository: &dyn Repository,
    ) -> Result<i64, StorageError> {
        let mut ids = self.ids.lock().await;
        if let Some(queue_id) = ids.get(name) {
            return Ok(*queue_id);
        }

        let queue_id = match repository.fetch_queue_id(name).await? {
            Some(queue_id) => queue_id,
            None => {
                let start = Instant::now();
                let queue_id = repository.create_queue(name).await?;
                trace!(queue.id = queue_id, "Created queue {name} in {:?}", start.elapsed());
                queue_id
            }
        };

        ids.insert(name.to_string(), queue_id);
        Ok(queue_id)
    }

    /// Forget a cached queue, for example after it was deleted.
    pub async fn invalidate(&self, name: &str) {
        self.ids.lock().await.remove(name);
    }
}

/// Publishes jobs and cancels pending ones.
///
/// Cloning is cheap; clones share the repository and the queue cache.
pub struct Messenger<Context> {
    repository: Arc<dyn Repository>,
    executor: JobExecutor<Context>,
    queues: Arc<QueueCache>,
    scope: QueueScope,
    default_queue_name: Option<DefaultQueueName>,
}

impl<Context> Clone for Messenger<Context> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            executor: self.executor.clone(),
            queues: self.queues.clone(),
            scope: self.scope.clone(),
            default_queue_name: self.default_queue_name.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Messenger<Context> {
    /// Messenger storing messages in `repository` and encoding calls against `registry`.
    pub fn new(repository: Arc<dyn Repository>, registry: Arc<JobRegistry<Context>>) -> Self {
        Self {
            repository,
            executor: JobExecutor::new(registry, Arc::new(JsonSerializer)),
            queues: Arc::new(QueueCache::new()),
            scope: QueueScope::root(),
            default_queue_name: None,
        }
    }

    /// Use an executor with a custom serializer or activator.
    pub fn with_executor(mut self, executor: JobExecutor<Context>) -> Self {
        self.executor = executor;
        self
    }

    /// Serialize arguments with `serializer`.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        let registry = self.executor.registry_arc().clone();
        self.executor = JobExecutor::new(registry, serializer);
        self
    }

    /// Share a queue cache with other messengers.
    pub fn with_queue_cache(mut self, queues: Arc<QueueCache>) -> Self {
        self.queues = queues;
        self
    }

    /// Resolve the queue of calls that name none from their type identifier.
    pub fn with_default_queue_name<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.default_queue_name = Some(Arc::new(resolver));
        self
    }

    /// A messenger publishing inside `scope`.
    pub fn in_scope(&self, scope: &QueueScope) -> Self {
        let mut messenger = self.clone();
        messenger.scope = scope.clone();
        messenger
    }

    /// A messenger redirecting publishes to `queue_name` until dropped.
    pub fn enter_scope(&self, queue_name: impl Into<String>) -> Self {
        let mut messenger = self.clone();
        messenger.scope = self.scope.enter(queue_name);
        messenger
    }

    /// The scope publishes resolve against.
    pub fn scope(&self) -> &QueueScope {
        &self.scope
    }

    /// The storage messages are written to.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Publish a call to the queue resolved from scope and defaults.
    ///
    /// Returns the message id, or `None` if a message with the same identity
    /// already exists.
    pub async fn publish(
        &self,
        call: JobCall,
        settings: PublishSettings,
    ) -> Result<Option<i64>, PublishError> {
        self.publish_to(call, QueueTarget::default(), settings).await
    }

    /// Publish a call to `target`.
    #[instrument(
        name = "messenger.publish",
        skip_all,
        fields(message.type = %call.type_name(), message.method = %call.method())
    )]
    pub async fn publish_to(
        &self,
        call: JobCall,
        target: impl Into<QueueTarget>,
        settings: PublishSettings,
    ) -> Result<Option<i64>, PublishError> {
        let start = Instant::now();
        let result = self.persist(call, target.into(), settings, None).await;
        trace!(
            "Publishing {} in {:?}",
            if result.is_ok() { "completed" } else { "failed" },
            start.elapsed()
        );
        result
    }

    /// Publish a call to a method that returns a value.
    ///
    /// The worker logs the value and discards it.
    #[instrument(
        name = "messenger.publish_function",
        skip_all,
        fields(message.type = %call.type_name(), message.method = %call.method())
    )]
    pub async fn publish_function(
        &self,
        call: JobCall,
        target: impl Into<QueueTarget>,
        settings: PublishSettings,
    ) -> Result<Option<i64>, PublishError> {
        self.persist(call, target.into(), settings, Some(JobKind::Function))
            .await
    }

    async fn persist(
        &self,
        call: JobCall,
        target: QueueTarget,
        settings: PublishSettings,
        expected: Option<JobKind>,
    ) -> Result<Option<i64>, PublishError> {
        let content_type = call.type_name().to_string();
        let queue_name = target.resolve(&self.scope, || {
            self.default_queue_name
                .as_ref()
                .and_then(|resolve| resolve(content_type.as_str()))
        });

        let descriptor = self.executor.encode(call)?;
        if let Some(expected) = expected {
            if descriptor.kind() != expected {
                return Err(JobError::encode(format!(
                    "`{}::{}` does not return a value",
                    descriptor.invocation().type_name,
                    descriptor.invocation().method
                ))
                .into());
            }
        }

        let content = descriptor.to_content()?;
        let identity = settings.identity;
        let delay = Duration::from_secs(u64::from(settings.delay_execution_in_seconds));
        let highest_priority = settings.highest_priority;
        let context = serde_json::to_string(&MessageContext {
            settings: Some(settings),
            queue_name: queue_name.clone(),
            create_date: Utc::now(),
        })?;

        let queue_id = self
            .queues
            .queue_id(&queue_name, self.repository.as_ref())
            .await?;

        let message = NewMessage {
            queue_id,
            content_type,
            content,
            context: Some(context),
            identity: identity.unwrap_or_else(Uuid::new_v4),
            deduplicate: identity.is_some(),
        };

        let start = Instant::now();
        let message_id = if highest_priority {
            self.repository.insert_message(message, delay).await?
        } else {
            self.repository.create_message(message, delay).await?
        };
        trace!(
            queue.id = queue_id,
            "Created new message in the queue {queue_name} in {:?}",
            start.elapsed()
        );

        Ok(message_id)
    }

    /// Cancel pending messages with `identity` that have not become eligible
    /// yet, and drop the identity from the failed archive.
    ///
    /// Returns `false` when nothing was removed, for example because the
    /// message is already running or done.
    #[instrument(name = "messenger.cancel", skip(self))]
    pub async fn cancel(&self, identity: Uuid) -> Result<bool, StorageError> {
        Ok(self.repository.cancel_messages(identity).await? > 0)
    }
}
