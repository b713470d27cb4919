//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the queue tables and the read models
//! returned by the administrative queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A queue as returned by the lock query.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct QueueInfo {
    /// Unique identifier of the queue
    pub queue_id: i64,
    /// Unique queue name
    pub name: String,
    /// Length of the current failure streak
    pub retries: Option<i32>,
}

/// A pending message of a locked queue.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MessageInfo {
    /// Unique identifier of the message
    pub message_id: i64,
    /// Declaring type of the job
    pub content_type: String,
    /// Serialized job descriptor
    pub content: String,
    /// Serialized publish context
    pub context: Option<String>,
    /// Earliest eligible execution time
    pub start_date: DateTime<Utc>,
    /// Caller supplied correlation id
    pub identity: Option<Uuid>,
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning queue
    pub queue_id: i64,
    /// Declaring type of the job
    pub content_type: String,
    /// Serialized job descriptor
    pub content: String,
    /// Serialized publish context
    pub context: Option<String>,
    /// Correlation id
    pub identity: Uuid,
    /// Skip the insert when a message with the same identity already exists
    pub deduplicate: bool,
}

/// Overall counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MessengerStatus {
    /// `Ready`, `Completed` or `Failed`
    pub status: String,
    /// Number of messages in that state
    pub message_count: i64,
}

/// State of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct QueueStatus {
    #[allow(missing_docs)]
    pub queue_id: i64,
    #[allow(missing_docs)]
    pub name: String,
    /// Last time the queue was locked
    pub processed_at: Option<DateTime<Utc>>,
    /// Set while a worker holds the queue
    pub processing_started: Option<DateTime<Utc>>,
    /// Owner of the lock
    pub process_name: Option<String>,
    #[allow(missing_docs)]
    pub retries: Option<i32>,
    /// End of the current backoff
    pub next_try_time: Option<DateTime<Utc>>,
    /// Last formatted error
    pub error: Option<String>,
    /// Number of pending messages
    pub message_count: i64,
}

/// A worker known through its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ProcessStatus {
    #[allow(missing_docs)]
    pub process_name: String,
    #[allow(missing_docs)]
    pub last_beat: DateTime<Utc>,
}

/// A pending message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MessageDetails {
    #[allow(missing_docs)]
    pub message_id: i64,
    #[allow(missing_docs)]
    pub queue_id: i64,
    #[allow(missing_docs)]
    pub content_type: String,
    #[allow(missing_docs)]
    pub content: String,
    #[allow(missing_docs)]
    pub context: Option<String>,
    #[allow(missing_docs)]
    pub start_date: DateTime<Utc>,
    #[allow(missing_docs)]
    pub identity: Option<Uuid>,
}

/// A message in the completed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct CompletedMessage {
    #[allow(missing_docs)]
    pub completed_message_id: i64,
    #[allow(missing_docs)]
    pub content_type: String,
    #[allow(missing_docs)]
    pub content: String,
    #[allow(missing_docs)]
    pub context: Option<String>,
    /// Start date the message had when it ran
    pub create_date: DateTime<Utc>,
    #[allow(missing_docs)]
    pub completed_date: DateTime<Utc>,
    #[allow(missing_docs)]
    pub identity: Option<Uuid>,
}

/// A message in the failed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct FailedMessage {
    #[allow(missing_docs)]
    pub failed_message_id: i64,
    #[allow(missing_docs)]
    pub content_type: String,
    #[allow(missing_docs)]
    pub content: String,
    #[allow(missing_docs)]
    pub context: Option<String>,
    /// Start date the message had when it failed
    pub create_date: DateTime<Utc>,
    #[allow(missing_docs)]
    pub failed_date: DateTime<Utc>,
    /// Last formatted error
    pub error: Option<String>,
    #[allow(missing_docs)]
    pub identity: Option<Uuid>,
}

/// A message looked up by identity in any of the three tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state")]
pub enum MessageState {
    /// Waiting in a queue
    Ready(MessageDetails),
    /// In the completed archive
    Completed(CompletedMessage),
    /// In the failed archive
    Failed(FailedMessage),
}

/// Optional time window for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub(crate) fn contains(&self, date: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date < to)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// One based page number
    pub number: u32,
    /// Rows per page
    pub size: u32,
}

impl Page {
    /// Page `number` (one based) of `size` rows.
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number: number.max(1),
            size,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        usize::try_from(u64::from(self.number.saturating_sub(1)) * u64::from(self.size))
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn limit(&self) -> usize {
        usize::try_from(self.size).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offsets_saturate_instead_of_overflowing() {
        assert_eq!(Page::new(0, 10).offset(), 0);
        assert_eq!(Page::new(3, 10).offset(), 20);
        assert_eq!(Page::new(3, 10).limit(), 10);

        let last = Page::new(u32::MAX, u32::MAX);
        let expected = u64::from(u32::MAX - 1) * u64::from(u32::MAX);
        assert_eq!(
            last.offset(),
            usize::try_from(expected).unwrap_or(usize::MAX)
        );
    }
}
