#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod errors;
mod executor;
mod job;
mod job_registry;
mod memory;
mod parameter;
mod processor;
mod publisher;
mod repository;
/// Database schema definitions.
pub mod schema;
mod scope;
mod serializer;
mod server;
mod service;
mod settings;
mod storage;
mod supervisor;
mod util;
mod worker;

/// Periodic purge of the completed archive.
pub use self::cleaner::CleanupService;
pub use self::errors::{
    JobCancelled, JobError, ProcessingError, PublishError, StorageError, SupervisionError,
};
pub use self::executor::{Activator, DecodedJob, InvocationOutcome, JobContext, JobExecutor};
pub use self::job::{Arg, Invocation, JobCall, JobDescriptor, JobKind};
pub use self::job_registry::{
    Instance, JobRegistry, JobType, Method, MethodSignature, ResolvedMethod, Visibility,
};
/// In-process storage for tests and embedders.
pub use self::memory::MemoryRepository;
pub use self::parameter::{
    Arguments, ByRef, Deferred, FromArguments, Generic, JobParameter, JobReturn, OBJECT_TYPE, Out,
    Parameter, ParameterType, Passing, RawArgument, ReturnShape, T, TypeVariable, U,
};
pub use self::processor::{MessageProcessor, QueueDecision, Recovery, ResultState};
/// Publishing and cancelling jobs.
pub use self::publisher::{Messenger, QueueCache};
pub use self::repository::{ProcessingTransaction, Repository, TransactionStatus};
pub use self::scope::{DEFAULT_QUEUE, QueueScope, QueueTarget, RETRY_FAILED_QUEUE};
pub use self::serializer::{JsonSerializer, Serializer};
pub use self::server::{Server, ServerHandle};
pub use self::service::MessengerService;
pub use self::settings::{
    CompletedMessages, DEFAULT_JOB_TIMEOUT, DEFAULT_MAX_RETRIES_BEFORE_FAIL, FailedMessageRecovery,
    IsolationLevel, JobSettings, MessageContext, NEXT_TRY_AFTER_FAIL, ProcessNameFormat,
    PublishSettings, RecoveryMode, ServerSettings,
};
/// Postgres storage.
pub use self::storage::{PgRepository, setup_database};
