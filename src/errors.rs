use crate::repository::TransactionStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while describing, resolving or running a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The call cannot be turned into a replayable descriptor.
    #[error("Unable to encode job: {reason}")]
    Encode {
        /// Why the call was rejected.
        reason: String,
    },

    /// No registered method matches the descriptor.
    #[error("The type `{type_name}` does not contain a method with signature `{method}({})`", .parameter_types.join(", "))]
    MethodNotFound {
        /// Declaring type identifier.
        type_name: String,
        /// Method name.
        method: String,
        /// Parameter type identifiers that were tried.
        parameter_types: Vec<String>,
    },

    /// The activator could not produce a usable target instance.
    #[error("An exception occurred during activation of `{type_name}`: {source}")]
    Activation {
        /// Declaring type identifier.
        type_name: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// A serialized argument could not be turned back into a value.
    #[error("Unable to deserialize argument {position} as `{parameter_type}`: {reason}")]
    Arguments {
        /// Zero based parameter position.
        position: usize,
        /// Parameter type identifier.
        parameter_type: String,
        /// Why deserialization failed.
        reason: String,
    },

    /// The job body failed.
    #[error("An exception occurred during performance of the job: {0:#}")]
    Invocation(#[source] anyhow::Error),

    /// The job ran but the target instance could not be cleaned up.
    #[error("Job has been performed, but an exception occurred during disposal: {0:#}")]
    Disposal(#[source] anyhow::Error),

    /// The stored descriptor is not a valid job envelope.
    #[error("Could not load the job descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

impl JobError {
    pub(crate) fn encode(reason: impl Into<String>) -> Self {
        Self::Encode {
            reason: reason.into(),
        }
    }
}

/// Marker error a job returns to signal cooperative cancellation.
///
/// It is never wrapped: the executor reports it as
/// [`InvocationOutcome::Cancelled`](crate::InvocationOutcome::Cancelled).
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("Job execution was cancelled")]
pub struct JobCancelled;

/// Any failure of a [`Repository`](crate::Repository) call.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error reported by the database driver.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error while running migrations.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A row referenced by the operation does not exist.
    #[error("{entity} {id} does not exist")]
    NotFound {
        /// Kind of row.
        entity: &'static str,
        /// Row id.
        id: i64,
    },

    /// The transaction can no longer be used.
    #[error("Transaction is no longer active: {0:?}")]
    TransactionClosed(TransactionStatus),
}

/// Error type for publish operations.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The job call was rejected at encode time.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The publish context could not be serialized.
    #[error("Failed to serialize message context: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The message could not be stored.
    #[error(transparent)]
    DatabaseError(#[from] StorageError),
}

/// Terminal failure of a single message.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Decoding, activation, invocation or disposal failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The invocation returned normally but its transaction cannot commit.
    #[error("Invalid transaction status: [{status:?}]! Unable to commit!")]
    TransactionIntegrity {
        /// Status observed after the invocation.
        status: TransactionStatus,
    },

    /// The invocation exceeded the job timeout.
    #[error("Job did not complete within {0:?}")]
    Timeout(Duration),

    /// The message context could not be parsed.
    #[error("Invalid message context: {0}")]
    Context(#[from] serde_json::Error),

    /// A storage call made while processing failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of a heartbeat, recovery or cleanup step.
#[derive(Debug, Error)]
#[error("{operation} failed: {source}")]
pub struct SupervisionError {
    /// What the supervisor was doing.
    pub operation: &'static str,
    /// Underlying cause.
    #[source]
    pub source: StorageError,
}

impl SupervisionError {
    pub(crate) fn new(operation: &'static str, source: StorageError) -> Self {
        Self { operation, source }
    }
}
