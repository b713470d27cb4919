//! Decoding stored descriptors and running them.

use crate::errors::{JobCancelled, JobError};
use crate::job::{JobCall, JobDescriptor};
use crate::job_registry::{Instance, JobRegistry, ResolvedMethod};
use crate::parameter::Arguments;
use crate::scope::QueueScope;
use crate::serializer::Serializer;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Creates the target instance of a job.
///
/// Without a custom activator the factory registered on the
/// [`JobType`](crate::JobType) is used.
pub trait Activator<Context>: Send + Sync + 'static {
    /// Create an instance of `type_name`. `Ok(None)` fails the job.
    fn activate(&self, type_name: &str, context: &Context) -> anyhow::Result<Option<Instance>>;
}

impl<Context, F> Activator<Context> for F
where
    F: Fn(&str, &Context) -> anyhow::Result<Option<Instance>> + Send + Sync + 'static,
{
    fn activate(&self, type_name: &str, context: &Context) -> anyhow::Result<Option<Instance>> {
        self(type_name, context)
    }
}

/// Everything a job handler gets besides its arguments.
#[derive(Debug, Clone)]
pub struct JobContext<Context> {
    context: Context,
    cancellation: CancellationToken,
    scope: QueueScope,
    message_id: Option<i64>,
    identity: Option<Uuid>,
    type_arguments: Vec<(String, String)>,
}

impl<Context> JobContext<Context> {
    /// A context outside of any queue.
    pub fn new(context: Context, cancellation: CancellationToken) -> Self {
        Self {
            context,
            cancellation,
            scope: QueueScope::root(),
            message_id: None,
            identity: None,
            type_arguments: Vec::new(),
        }
    }

    pub(crate) fn for_message(
        mut self,
        message_id: i64,
        identity: Option<Uuid>,
        queue_name: &str,
    ) -> Self {
        self.message_id = Some(message_id);
        self.identity = identity;
        self.scope = self.scope.enter(queue_name);
        self
    }

    fn with_type_arguments(mut self, type_arguments: &[(String, String)]) -> Self {
        self.type_arguments = type_arguments.to_vec();
        self
    }

    /// The application context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Token cancelled when the server shuts down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the server is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail with [`JobCancelled`] once the server is shutting down.
    ///
    /// ```ignore
    /// for chunk in chunks {
    ///     ctx.check_cancelled()?;
    ///     process(chunk).await?;
    /// }
    /// ```
    pub fn check_cancelled(&self) -> Result<(), JobCancelled> {
        match self.cancellation.is_cancelled() {
            true => Err(JobCancelled),
            false => Ok(()),
        }
    }

    /// Scope follow-up publishes default to: the queue being processed.
    pub fn queue_scope(&self) -> &QueueScope {
        &self.scope
    }

    /// Id of the message being processed.
    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    /// Correlation id of the message being processed.
    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    /// Generic parameters of the method and the types they were closed with.
    pub fn type_arguments(&self) -> &[(String, String)] {
        &self.type_arguments
    }

    /// Concrete type a generic parameter was closed with.
    pub fn type_argument(&self, name: &str) -> Option<&str> {
        self.type_arguments
            .iter()
            .find(|(parameter, _)| parameter == name)
            .map(|(_, ty)| ty.as_str())
    }
}

/// Result of running a job.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// The job finished. Function jobs carry their result.
    Completed(Option<Value>),
    /// The job stopped because cancellation was requested.
    Cancelled,
    /// The job could not be decoded, activated, run or disposed.
    Failed(JobError),
}

impl InvocationOutcome {
    /// Whether the job finished.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A descriptor together with the method it resolved to.
pub struct DecodedJob<Context> {
    descriptor: JobDescriptor,
    method: ResolvedMethod<Context>,
}

impl<Context> DecodedJob<Context> {
    /// The stored descriptor.
    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// The resolved method.
    pub fn method(&self) -> &ResolvedMethod<Context> {
        &self.method
    }
}

/// Encodes calls and runs stored descriptors against a [`JobRegistry`].
pub struct JobExecutor<Context> {
    registry: Arc<JobRegistry<Context>>,
    serializer: Arc<dyn Serializer>,
    activator: Option<Arc<dyn Activator<Context>>>,
}

impl<Context> Clone for JobExecutor<Context> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            serializer: self.serializer.clone(),
            activator: self.activator.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobExecutor<Context> {
    /// Executor over `registry`, serializing arguments with `serializer`.
    pub fn new(registry: Arc<JobRegistry<Context>>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            registry,
            serializer,
            activator: None,
        }
    }

    /// Create target instances with `activator` instead of the registered factories.
    pub fn with_activator(mut self, activator: impl Activator<Context>) -> Self {
        self.activator = Some(Arc::new(activator));
        self
    }

    /// The registry calls are resolved against.
    pub fn registry(&self) -> &JobRegistry<Context> {
        &self.registry
    }

    pub(crate) fn registry_arc(&self) -> &Arc<JobRegistry<Context>> {
        &self.registry
    }

    /// Turn a call into a descriptor.
    pub fn encode(&self, call: JobCall) -> Result<JobDescriptor, JobError> {
        self.registry.encode(call, self.serializer.as_ref())
    }

    /// Parse stored content and resolve its method.
    pub fn decode(&self, content: &str) -> Result<DecodedJob<Context>, JobError> {
        let descriptor = JobDescriptor::from_content(content)?;
        let method = self.registry.resolve(descriptor.invocation())?;
        Ok(DecodedJob { descriptor, method })
    }

    /// Decode and run stored content.
    pub async fn execute(&self, content: &str, ctx: JobContext<Context>) -> InvocationOutcome {
        match self.decode(content) {
            Ok(job) => self.invoke(job, ctx).await,
            Err(error) => InvocationOutcome::Failed(error),
        }
    }

    /// Run a decoded job.
    ///
    /// Panics inside the job are caught and reported as invocation failures.
    /// A [`JobCancelled`] error is reported as [`InvocationOutcome::Cancelled`].
    pub async fn invoke(
        &self,
        job: DecodedJob<Context>,
        ctx: JobContext<Context>,
    ) -> InvocationOutcome {
        let invocation = job.descriptor.invocation();
        let type_name = invocation.type_name.as_str();

        let instance = if job.method.signature().is_static {
            None
        } else {
            match self.activate(type_name, ctx.context()) {
                Ok(instance) => Some(instance),
                Err(error) => return InvocationOutcome::Failed(error),
            }
        };

        let receiver = match &instance {
            None => None,
            Some(instance) => match job.method.receiver(instance.clone()) {
                Some(receiver) => Some(receiver),
                None => {
                    return InvocationOutcome::Failed(JobError::Activation {
                        type_name: type_name.to_string(),
                        source: anyhow::anyhow!(
                            "the instance does not derive from the type declaring `{}`",
                            invocation.method
                        ),
                    });
                }
            },
        };

        let arguments = Arguments::new(
            invocation.arguments.clone(),
            invocation.parameter_types.clone(),
            self.serializer.clone(),
        );
        let ctx = ctx.with_type_arguments(job.method.type_arguments());

        let outcome = match job.method.call(receiver, arguments, ctx) {
            Err(error) => InvocationOutcome::Failed(error),
            Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Err(panic) => InvocationOutcome::Failed(JobError::Invocation(
                    try_to_extract_panic_info(&*panic),
                )),
                Ok(Err(error)) if error.is::<JobCancelled>() => InvocationOutcome::Cancelled,
                Ok(Err(error)) => InvocationOutcome::Failed(JobError::Invocation(error)),
                Ok(Ok(output)) => InvocationOutcome::Completed(output),
            },
        };

        let Some(instance) = instance else {
            return outcome;
        };

        match (self.registry.dispose(type_name, &instance), outcome) {
            (Ok(()), outcome) => outcome,
            (Err(error), InvocationOutcome::Completed(_)) => {
                InvocationOutcome::Failed(JobError::Disposal(error))
            }
            (Err(error), outcome) => {
                warn!("Failed to dispose of `{type_name}` after an unsuccessful job: {error:#}");
                outcome
            }
        }
    }

    fn activate(&self, type_name: &str, context: &Context) -> Result<Instance, JobError> {
        debug!("Activating `{type_name}`…");

        let activated = match &self.activator {
            Some(activator) => activator.activate(type_name, context),
            None => self.registry.activate(type_name, context),
        };

        match activated {
            Ok(Some(instance)) => Ok(instance),
            Ok(None) => Err(JobError::Activation {
                type_name: type_name.to_string(),
                source: anyhow::anyhow!("the activator returned no instance"),
            }),
            Err(source) => Err(JobError::Activation {
                type_name: type_name.to_string(),
                source,
            }),
        }
    }
}
