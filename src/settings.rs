//! Publish-time and server-side configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Delay applied to a failing queue before it is retried.
pub const NEXT_TRY_AFTER_FAIL: Duration = Duration::from_secs(30);
/// Retry budget used when a message carries no explicit budget.
pub const DEFAULT_MAX_RETRIES_BEFORE_FAIL: u32 = 10;
/// Job timeout used when a message carries no explicit timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_JITTER: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_MESSAGE_BATCH_SIZE: usize = 10;
pub(crate) const DEFAULT_SUPERVISION_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_STALE_PROCESS_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Policy applied once a queue's failure streak reaches its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Keep retrying the queue with backoff until an operator intervenes.
    Block,
    /// Move the failing message to the failed archive and release the queue.
    #[default]
    MarkAsFailed,
    /// Push the failing message to the back of its queue and release the queue.
    MakeLast,
}

/// Isolation level of the transaction a job runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[allow(missing_docs)]
    Serializable,
    #[allow(missing_docs)]
    RepeatableRead,
    #[allow(missing_docs)]
    #[default]
    ReadCommitted,
    #[allow(missing_docs)]
    ReadUncommitted,
    #[allow(missing_docs)]
    Snapshot,
    #[allow(missing_docs)]
    Unspecified,
}

impl IsolationLevel {
    /// The Postgres `SET TRANSACTION` clause for this level.
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead | Self::Snapshot => "REPEATABLE READ",
            Self::ReadCommitted | Self::Unspecified => "READ COMMITTED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Options supplied by the caller when a job is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// What to do once the retry budget is exhausted.
    pub recovery_mode: RecoveryMode,
    /// Isolation level of the job transaction.
    pub job_isolation_level: IsolationLevel,
    /// Upper bound for a single job execution.
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    /// Failures tolerated before the recovery mode applies. Zero means the server default.
    pub max_retries_before_fail: u32,
    /// Delay before the message becomes eligible.
    pub delay_execution_in_seconds: u32,
    /// Do not archive the message once it completes.
    pub discard_when_complete: bool,
    /// Insert ahead of the queue's current earliest message.
    pub highest_priority: bool,
    /// Caller supplied correlation id. Publishing is idempotent when set.
    pub identity: Option<Uuid>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            recovery_mode: RecoveryMode::MarkAsFailed,
            job_isolation_level: IsolationLevel::ReadCommitted,
            job_timeout: Duration::from_secs(10 * 60),
            max_retries_before_fail: 2,
            delay_execution_in_seconds: 0,
            discard_when_complete: false,
            highest_priority: false,
            identity: None,
        }
    }
}

impl PublishSettings {
    /// Set the recovery mode.
    pub fn recovery_mode(mut self, recovery_mode: RecoveryMode) -> Self {
        self.recovery_mode = recovery_mode;
        self
    }

    /// Set the isolation level of the job transaction.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.job_isolation_level = level;
        self
    }

    /// Set the job timeout.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the number of failures tolerated before recovery.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries_before_fail = retries;
        self
    }

    /// Delay execution by the given number of seconds.
    pub fn delay(mut self, seconds: u32) -> Self {
        self.delay_execution_in_seconds = seconds;
        self
    }

    /// Skip the completed archive for this message.
    pub fn discard_when_complete(mut self) -> Self {
        self.discard_when_complete = true;
        self
    }

    /// Run ahead of the messages already waiting in the queue.
    pub fn highest_priority(mut self) -> Self {
        self.highest_priority = true;
        self
    }

    /// Attach a correlation id.
    pub fn identity(mut self, identity: Uuid) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Publish metadata persisted next to each message.
///
/// Every field is optional on read so that partial contexts written by other
/// publishers still resolve to the server defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageContext {
    /// Settings given at publish time.
    pub settings: Option<PublishSettings>,
    /// Queue the message was published to.
    pub queue_name: String,
    /// Publish time.
    pub create_date: DateTime<Utc>,
}

/// Effective per-message settings after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    /// Recovery policy.
    pub recovery_mode: RecoveryMode,
    /// Isolation level of the job transaction.
    pub isolation_level: IsolationLevel,
    /// Job timeout.
    pub timeout: Duration,
    /// Retry budget.
    pub max_retries: u32,
    /// Skip the completed archive.
    pub discard_when_complete: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            recovery_mode: RecoveryMode::MarkAsFailed,
            isolation_level: IsolationLevel::ReadCommitted,
            timeout: DEFAULT_JOB_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES_BEFORE_FAIL,
            discard_when_complete: false,
        }
    }
}

impl JobSettings {
    /// Derive the settings of a message from its optional context.
    pub fn from_context(context: Option<&MessageContext>) -> Self {
        let Some(settings) = context.and_then(|c| c.settings.as_ref()) else {
            return Self::default();
        };

        Self {
            recovery_mode: settings.recovery_mode,
            isolation_level: settings.job_isolation_level,
            timeout: if settings.job_timeout.is_zero() {
                DEFAULT_JOB_TIMEOUT
            } else {
                settings.job_timeout
            },
            max_retries: if settings.max_retries_before_fail == 0 {
                DEFAULT_MAX_RETRIES_BEFORE_FAIL
            } else {
                settings.max_retries_before_fail
            },
            discard_when_complete: settings.discard_when_complete,
        }
    }
}

/// Retention of completed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletedMessages {
    /// Copy completed messages into the completed archive.
    pub archive: bool,
    /// Periodically purge the completed archive.
    pub cleanup: bool,
    /// Purge archived messages older than this age. `None` purges everything
    /// completed before the start of the current UTC day.
    #[serde(with = "option_duration_secs")]
    pub clean_older_than: Option<Duration>,
}

impl CompletedMessages {
    /// Cutoff for the next purge.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.clean_older_than {
            Some(age) => crate::util::time_before(now, age),
            None => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map_or(now, |midnight| midnight.and_utc()),
        }
    }
}

/// Window of failed messages the supervisor moves back into the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedMessageRecovery {
    /// Whether the sweep runs at all.
    pub enabled: bool,
    /// Only messages that failed at least this long ago are retried.
    #[serde(with = "duration_secs")]
    pub older_than: Duration,
    /// Messages that failed longer ago than this are left alone.
    #[serde(with = "duration_secs")]
    pub newer_than: Duration,
    /// Number of failed messages moved per round trip.
    pub batch_size: usize,
}

impl Default for FailedMessageRecovery {
    fn default() -> Self {
        Self {
            enabled: true,
            older_than: Duration::from_secs(60 * 60),
            newer_than: Duration::from_secs(5 * 24 * 60 * 60),
            batch_size: 10,
        }
    }
}

/// How worker process names are built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessNameFormat {
    /// `{host}:{pid}:{slot}`
    #[default]
    HostAndProcessId,
    /// `{host}:{slot} at {directory of the executable}`
    HostAndDirectory,
    /// `{host}:{slot} [{name}]`
    Custom(String),
}

impl ProcessNameFormat {
    /// Process name of worker slot `slot`.
    pub fn process_name(&self, slot: usize) -> String {
        let host = host_name();
        match self {
            Self::HostAndProcessId => format!("{host}:{}:{slot}", std::process::id()),
            Self::HostAndDirectory => {
                let directory = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(|dir| dir.display().to_string()))
                    .unwrap_or_default();
                format!("{host}:{slot} at {directory}")
            }
            Self::Custom(name) => format!("{host}:{slot} [{name}]"),
        }
    }
}

fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Sleep between polls when no queue is available.
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    /// Maximum random jitter added to the check interval.
    #[serde(with = "duration_secs")]
    pub jitter: Duration,
    /// Number of worker slots.
    pub max_process_count: usize,
    /// Messages processed per queue lock.
    pub message_batch_size: usize,
    /// Naming of worker slots.
    pub process_name_format: ProcessNameFormat,
    /// Retention of completed messages.
    pub completed_messages: CompletedMessages,
    /// Failed message retry sweep.
    pub failed_message_recovery: FailedMessageRecovery,
    /// Cadence of the supervision loop.
    #[serde(with = "duration_secs")]
    pub supervision_interval: Duration,
    /// Heartbeat age after which a process is considered dead.
    #[serde(with = "duration_secs")]
    pub stale_process_threshold: Duration,
    /// Cadence of the completed message purge.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Backoff applied to a queue after a failed batch.
    #[serde(with = "duration_secs")]
    pub failure_backoff: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            jitter: DEFAULT_JITTER,
            max_process_count: default_process_count(),
            message_batch_size: DEFAULT_MESSAGE_BATCH_SIZE,
            process_name_format: ProcessNameFormat::default(),
            completed_messages: CompletedMessages::default(),
            failed_message_recovery: FailedMessageRecovery::default(),
            supervision_interval: DEFAULT_SUPERVISION_INTERVAL,
            stale_process_threshold: DEFAULT_STALE_PROCESS_THRESHOLD,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            failure_backoff: NEXT_TRY_AFTER_FAIL,
        }
    }
}

fn default_process_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) * 2
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|seconds| Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_context_uses_server_defaults() {
        let settings = JobSettings::from_context(None);
        assert_eq!(settings.max_retries, 10);
        assert_eq!(settings.timeout, Duration::from_secs(30 * 60));
        assert_eq!(settings.isolation_level, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn zero_values_fall_back_to_server_defaults() {
        let context = MessageContext {
            settings: Some(PublishSettings::default().max_retries(0).job_timeout(Duration::ZERO)),
            queue_name: "q".into(),
            create_date: Utc::now(),
        };

        let settings = JobSettings::from_context(Some(&context));
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES_BEFORE_FAIL);
        assert_eq!(settings.timeout, DEFAULT_JOB_TIMEOUT);
    }

    #[test]
    fn publish_defaults_are_kept() {
        let context = MessageContext {
            settings: Some(PublishSettings::default()),
            queue_name: "q".into(),
            create_date: Utc::now(),
        };

        let settings = JobSettings::from_context(Some(&context));
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.timeout, Duration::from_secs(600));
        assert_eq!(settings.recovery_mode, RecoveryMode::MarkAsFailed);
    }

    #[test]
    fn partial_contexts_resolve_to_defaults() {
        for raw in [r#"{"settings":null}"#, "{}", r#"{"queue_name":"q"}"#] {
            let context: MessageContext = serde_json::from_str(raw).unwrap();
            let settings = JobSettings::from_context(Some(&context));
            assert_eq!(settings, JobSettings::default(), "{raw}");
        }

        let context: MessageContext =
            serde_json::from_str(r#"{"settings":{"max_retries_before_fail":4}}"#).unwrap();
        let settings = JobSettings::from_context(Some(&context));
        assert_eq!(settings.max_retries, 4);
        assert_eq!(settings.timeout, Duration::from_secs(600));
    }

    #[test]
    fn custom_process_names_include_slot() {
        let name = ProcessNameFormat::Custom("billing".into()).process_name(3);
        assert!(name.ends_with(":3 [billing]"), "{name}");
    }
}
