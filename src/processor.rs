//! Draining a locked queue and deciding what happens to it afterwards.

use crate::errors::{ProcessingError, StorageError};
use crate::executor::{InvocationOutcome, JobContext, JobExecutor};
use crate::repository::{Repository, TransactionStatus};
use crate::schema::{MessageInfo, QueueInfo};
use crate::settings::{JobSettings, MessageContext, RecoveryMode};
use crate::util::{format_error, time_after, with_sentry_transaction};
use chrono::{DateTime, Utc};
use sentry_core::{Hub, SentryFutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultState {
    /// Messages completed before the batch stopped.
    pub processed: usize,
    /// Whether a message failed.
    pub failed: bool,
    /// Whether the batch stopped because cancellation was requested.
    pub cancelled: bool,
    /// Formatted error of the failing message.
    pub last_error: Option<String>,
    /// The last message the batch looked at.
    pub last_message_id: Option<i64>,
    /// Settings of that message.
    pub settings: JobSettings,
}

/// How a failing message is recovered once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Archive the message as failed and delete it.
    MarkAsFailed,
    /// Move the message behind the rest of its queue.
    MakeLast,
}

/// What happens to a queue after a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDecision {
    /// Unlock the queue and reset its failure streak.
    Release,
    /// Unlock the queue but keep it out of rotation until `next_try_time`.
    Backoff {
        /// New length of the failure streak.
        retries: i32,
        /// End of the backoff.
        next_try_time: DateTime<Utc>,
    },
    /// Get the failing message out of the way and release the queue.
    Recover {
        /// The failing message.
        message_id: i64,
        /// How it is moved out of the way.
        recovery: Recovery,
        /// Length of the failure streak that triggered the recovery.
        retries: i32,
    },
}

impl ResultState {
    /// Decide the fate of the queue, given its failure streak before the batch.
    ///
    /// A success anywhere in the batch resets the streak before this failure
    /// is counted. Backoff is linear: the same delay after every failure.
    pub fn decide(
        &self,
        queue_retries: Option<i32>,
        now: DateTime<Utc>,
        backoff: Duration,
    ) -> QueueDecision {
        if !self.failed {
            return QueueDecision::Release;
        }

        let streak = if self.processed > 0 {
            0
        } else {
            queue_retries.unwrap_or(0)
        };
        let retries = streak.saturating_add(1);
        let max_retries = i32::try_from(self.settings.max_retries).unwrap_or(i32::MAX);

        let recovery = match self.settings.recovery_mode {
            RecoveryMode::Block => None,
            RecoveryMode::MarkAsFailed => Some(Recovery::MarkAsFailed),
            RecoveryMode::MakeLast => Some(Recovery::MakeLast),
        };

        match (recovery, self.last_message_id) {
            (Some(recovery), Some(message_id)) if retries >= max_retries => {
                QueueDecision::Recover {
                    message_id,
                    recovery,
                    retries,
                }
            }
            _ => QueueDecision::Backoff {
                retries,
                next_try_time: time_after(now, backoff),
            },
        }
    }
}

enum Processed {
    Completed,
    Cancelled,
}

/// Runs the messages of a locked queue.
pub struct MessageProcessor<Context> {
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) executor: JobExecutor<Context>,
    pub(crate) context: Context,
    pub(crate) batch_size: usize,
    pub(crate) archive_completed: bool,
    pub(crate) failure_backoff: Duration,
}

impl<Context: Clone + Send + Sync + 'static> MessageProcessor<Context> {
    /// Processor running jobs through `executor` with `context`.
    pub fn new(
        repository: Arc<dyn Repository>,
        executor: JobExecutor<Context>,
        context: Context,
    ) -> Self {
        let defaults = crate::settings::ServerSettings::default();
        Self {
            repository,
            executor,
            context,
            batch_size: defaults.message_batch_size,
            archive_completed: defaults.completed_messages.archive,
            failure_backoff: defaults.failure_backoff,
        }
    }

    /// Messages processed per lock.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Keep completed messages in the completed archive.
    pub fn archive_completed(mut self, archive: bool) -> Self {
        self.archive_completed = archive;
        self
    }

    /// Delay before a failing queue is retried.
    pub fn failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Process a batch of `queue` and then release, back off or recover it.
    pub async fn run(
        &self,
        queue: &QueueInfo,
        cancellation: &CancellationToken,
    ) -> Result<QueueDecision, StorageError> {
        let state = self.process_queue(queue, cancellation).await?;
        self.complete(queue, &state).await
    }

    /// Process up to one batch of eligible messages, oldest first.
    ///
    /// Stops at the first failure so that later messages never overtake a
    /// failing one, and before each message once cancellation is requested.
    pub async fn process_queue(
        &self,
        queue: &QueueInfo,
        cancellation: &CancellationToken,
    ) -> Result<ResultState, StorageError> {
        let messages = self
            .repository
            .fetch_queue_messages(queue.queue_id, self.batch_size)
            .await?;

        let mut state = ResultState::default();
        for message in messages {
            if cancellation.is_cancelled() {
                state.cancelled = true;
                break;
            }

            state.last_message_id = Some(message.message_id);
            state.settings = JobSettings::default();

            let span = info_span!("message", message.id = message.message_id, queue.id = queue.queue_id);
            let result = self
                .process_message(queue, &message, &mut state.settings, cancellation)
                .instrument(span.clone())
                .await;

            match result {
                Ok(Processed::Completed) => {
                    state.processed += 1;
                }
                Ok(Processed::Cancelled) => {
                    debug!(parent: &span, "Message processing was cancelled");
                    state.cancelled = true;
                    break;
                }
                Err(error) => {
                    let formatted = format_error(&error, Some(message.message_id));
                    warn!(parent: &span, "{formatted}");
                    state.failed = true;
                    state.last_error = Some(formatted);
                    break;
                }
            }
        }

        Ok(state)
    }

    async fn process_message(
        &self,
        queue: &QueueInfo,
        message: &MessageInfo,
        settings: &mut JobSettings,
        cancellation: &CancellationToken,
    ) -> Result<Processed, ProcessingError> {
        let context = message
            .context
            .as_deref()
            .filter(|context| !context.trim().is_empty())
            .map(serde_json::from_str::<MessageContext>)
            .transpose()?;
        *settings = JobSettings::from_context(context.as_ref());
        let settings = *settings;

        let mut tx = self
            .repository
            .begin_processing(settings.isolation_level, settings.timeout)
            .await?;

        let ctx = JobContext::new(self.context.clone(), cancellation.clone()).for_message(
            message.message_id,
            message.identity,
            &queue.name,
        );

        debug!("Running message…");
        let executor = &self.executor;
        let content = message.content.as_str();
        let result = with_sentry_transaction(&message.content_type, async move || {
            let invocation = executor.execute(content, ctx);
            match tokio::time::timeout(settings.timeout, invocation).await {
                Err(_) => Err(ProcessingError::Timeout(settings.timeout)),
                Ok(InvocationOutcome::Failed(error)) => Err(error.into()),
                Ok(InvocationOutcome::Cancelled) => Ok(None),
                Ok(InvocationOutcome::Completed(output)) => Ok(Some(output)),
            }
        })
        .bind_hub(Hub::current())
        .await?;

        let Some(output) = result else {
            // The transaction rolls back when dropped.
            return Ok(Processed::Cancelled);
        };
        if let Some(output) = output {
            debug!("Job returned {output}");
        }

        match tx.status() {
            TransactionStatus::Active => {}
            status => return Err(ProcessingError::TransactionIntegrity { status }),
        }

        let archive = self.archive_completed && !settings.discard_when_complete;
        tx.remove_message(message.message_id, archive).await?;
        tx.commit().await?;

        debug!("Message completed");
        Ok(Processed::Completed)
    }

    /// Apply the decision for a finished batch.
    pub async fn complete(
        &self,
        queue: &QueueInfo,
        state: &ResultState,
    ) -> Result<QueueDecision, StorageError> {
        let decision = state.decide(queue.retries, Utc::now(), self.failure_backoff);
        let error = state.last_error.as_deref().unwrap_or_default();

        match &decision {
            QueueDecision::Release => {
                self.repository.release_queue(queue.queue_id).await?;
            }
            QueueDecision::Backoff {
                retries,
                next_try_time,
            } => {
                debug!(
                    queue.id = queue.queue_id,
                    "Queue failed {retries} time(s), retrying after {next_try_time}"
                );
                self.repository
                    .set_queue_failure(queue.queue_id, *retries, error, *next_try_time)
                    .await?;
            }
            QueueDecision::Recover {
                message_id,
                recovery,
                retries,
            } => {
                warn!(
                    queue.id = queue.queue_id,
                    message.id = message_id,
                    "Queue failed {retries} time(s), recovering with {recovery:?}"
                );

                let mut tx = self
                    .repository
                    .begin_processing(state.settings.isolation_level, state.settings.timeout)
                    .await?;
                match recovery {
                    Recovery::MakeLast => {
                        tx.move_message_to_end(*message_id).await?;
                    }
                    Recovery::MarkAsFailed => {
                        tx.copy_message_to_failed(*message_id, error).await?;
                        tx.remove_message(*message_id, false).await?;
                    }
                }
                tx.release_queue(queue.queue_id).await?;
                tx.commit().await?;
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(processed: usize, max_retries: u32, recovery_mode: RecoveryMode) -> ResultState {
        ResultState {
            processed,
            failed: true,
            last_error: Some("boom".into()),
            last_message_id: Some(7),
            settings: JobSettings {
                max_retries,
                recovery_mode,
                ..JobSettings::default()
            },
            ..ResultState::default()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    #[test]
    fn successful_batches_release_the_queue() {
        let state = ResultState {
            processed: 3,
            ..ResultState::default()
        };
        assert_eq!(
            state.decide(Some(4), now(), Duration::from_secs(30)),
            QueueDecision::Release
        );
    }

    #[test]
    fn failures_extend_the_streak_with_a_fixed_backoff() {
        let state = failed(0, 10, RecoveryMode::MarkAsFailed);
        assert_eq!(
            state.decide(Some(3), now(), Duration::from_secs(30)),
            QueueDecision::Backoff {
                retries: 4,
                next_try_time: now() + chrono::Duration::seconds(30),
            }
        );
        assert!(matches!(
            state.decide(None, now(), Duration::from_secs(30)),
            QueueDecision::Backoff { retries: 1, .. }
        ));
    }

    #[test]
    fn a_success_in_the_batch_resets_the_streak() {
        let state = failed(2, 10, RecoveryMode::MarkAsFailed);
        assert!(matches!(
            state.decide(Some(9), now(), Duration::from_secs(30)),
            QueueDecision::Backoff { retries: 1, .. }
        ));
    }

    #[test]
    fn exhausted_budgets_recover_unless_blocking() {
        let state = failed(0, 2, RecoveryMode::MarkAsFailed);
        assert_eq!(
            state.decide(Some(1), now(), Duration::from_secs(30)),
            QueueDecision::Recover {
                message_id: 7,
                recovery: Recovery::MarkAsFailed,
                retries: 2,
            }
        );

        let state = failed(0, 2, RecoveryMode::MakeLast);
        assert!(matches!(
            state.decide(Some(5), now(), Duration::from_secs(30)),
            QueueDecision::Recover {
                recovery: Recovery::MakeLast,
                retries: 6,
                ..
            }
        ));

        let state = failed(0, 2, RecoveryMode::Block);
        assert!(matches!(
            state.decide(Some(5), now(), Duration::from_secs(30)),
            QueueDecision::Backoff { retries: 6, .. }
        ));
    }
}
