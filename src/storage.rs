//! Postgres implementation of [`Repository`].

use crate::errors::StorageError;
use crate::repository::{ProcessingTransaction, Repository, TransactionStatus};
use crate::schema::{
    CompletedMessage, DateRange, FailedMessage, MessageDetails, MessageInfo, MessageState,
    MessengerStatus, NewMessage, Page, ProcessStatus, QueueInfo, QueueStatus,
};
use crate::settings::IsolationLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Run the bundled migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// [`Repository`] backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Repository using `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const MESSAGE_COLUMNS: &str =
    "message_id, queue_id, content_type, content, context, start_date, identity";
const COMPLETED_COLUMNS: &str = "completed_message_id, content_type, content, context, create_date, completed_date, identity";
const FAILED_COLUMNS: &str = "failed_message_id, content_type, content, context, create_date, failed_date, error, identity";

/// Insert a message, optionally skipping it when its identity already exists.
///
/// Deduplicated inserts take a transaction-scoped advisory lock on the
/// identity so that concurrent publishes of the same identity serialize.
async fn insert_message_tx(
    tx: &mut Transaction<'_, Postgres>,
    message: &NewMessage,
    start_date_sql: &str,
    delay: Duration,
) -> Result<Option<i64>, sqlx::Error> {
    if message.deduplicate {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(message.identity.to_string())
            .execute(&mut **tx)
            .await?;
    }

    let sql = format!(
        r"
        INSERT INTO messenger_messages (queue_id, content_type, content, context, start_date, identity)
        SELECT $1, $2, $3, $4, {start_date_sql}, $5
        WHERE NOT $6 OR NOT EXISTS (SELECT 1 FROM messenger_messages WHERE identity = $5)
        RETURNING message_id
        "
    );

    sqlx::query_scalar::<_, i64>(&sql)
        .bind(message.queue_id)
        .bind(&message.content_type)
        .bind(&message.content)
        .bind(&message.context)
        .bind(message.identity)
        .bind(message.deduplicate)
        .bind(delay.as_secs_f64())
        .fetch_optional(&mut **tx)
        .await
}

#[async_trait]
impl Repository for PgRepository {
    async fn fetch_queue_id(&self, name: &str) -> Result<Option<i64>, StorageError> {
        let queue_id =
            sqlx::query_scalar::<_, i64>("SELECT queue_id FROM messenger_queues WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(queue_id)
    }

    async fn create_queue(&self, name: &str) -> Result<i64, StorageError> {
        let queue_id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO messenger_queues (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING queue_id
            ",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(queue_id)
    }

    async fn delete_queue(&self, queue_id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM messenger_queues WHERE queue_id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let message_id =
            insert_message_tx(&mut tx, &message, "NOW() + make_interval(secs => $7)", delay)
                .await?;
        tx.commit().await?;
        Ok(message_id)
    }

    async fn insert_message(
        &self,
        message: NewMessage,
        delay: Duration,
    ) -> Result<Option<i64>, StorageError> {
        // One microsecond ahead of the earliest message, so it sorts first.
        let start_date = r"COALESCE(
            (SELECT MIN(start_date) FROM messenger_messages WHERE queue_id = $1) - INTERVAL '1 microsecond',
            NOW()) + make_interval(secs => $7)";

        let mut tx = self.pool.begin().await?;
        let message_id = insert_message_tx(&mut tx, &message, start_date, delay).await?;
        tx.commit().await?;
        Ok(message_id)
    }

    async fn cancel_messages(&self, identity: Uuid) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query(
            "DELETE FROM messenger_messages WHERE identity = $1 AND start_date > NOW()",
        )
        .bind(identity)
        .execute(&mut *tx)
        .await?;

        let failed = sqlx::query("DELETE FROM messenger_failed_messages WHERE identity = $1")
            .bind(identity)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(pending.rows_affected() + failed.rows_affected())
    }

    async fn remove_messages(&self, identities: &[Uuid]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query("DELETE FROM messenger_messages WHERE identity = ANY($1)")
            .bind(identities)
            .execute(&mut *tx)
            .await?;

        let failed = sqlx::query("DELETE FROM messenger_failed_messages WHERE identity = ANY($1)")
            .bind(identities)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(pending.rows_affected() + failed.rows_affected())
    }

    async fn begin_processing(
        &self,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<Box<dyn ProcessingTransaction>, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgProcessingTransaction {
            tx: Some(tx),
            deadline: Instant::now() + timeout,
            failed: false,
        }))
    }

    async fn lock_queue(&self, process_name: &str) -> Result<Option<QueueInfo>, StorageError> {
        let queue = sqlx::query_as::<_, QueueInfo>(
            r"
            UPDATE messenger_queues
            SET processing_started = NOW(), process_name = $1, processed_at = NOW()
            WHERE queue_id = (
                SELECT q.queue_id
                FROM messenger_queues q
                JOIN messenger_messages m ON m.queue_id = q.queue_id
                WHERE q.processing_started IS NULL
                  AND m.start_date <= NOW()
                  AND (q.next_try_time IS NULL OR q.next_try_time < NOW())
                ORDER BY m.start_date ASC, m.message_id ASC
                LIMIT 1
                FOR UPDATE OF q SKIP LOCKED
            )
            RETURNING queue_id, name, retries
            ",
        )
        .bind(process_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(queue)
    }

    async fn release_queue(&self, queue_id: i64) -> Result<(), StorageError> {
        sqlx::query(RELEASE_QUEUE_SQL)
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_queue_failure(
        &self,
        queue_id: i64,
        retries: i32,
        error: &str,
        next_try_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE messenger_queues
            SET processing_started = NULL, process_name = NULL,
                retries = $2, error = $3, next_try_time = $4
            WHERE queue_id = $1
            ",
        )
        .bind(queue_id)
        .bind(retries)
        .bind(error)
        .bind(next_try_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_queue_messages(
        &self,
        queue_id: i64,
        count: usize,
    ) -> Result<Vec<MessageInfo>, StorageError> {
        let messages = sqlx::query_as::<_, MessageInfo>(
            r"
            SELECT message_id, content_type, content, context, start_date, identity
            FROM messenger_messages
            WHERE queue_id = $1 AND start_date <= NOW()
            ORDER BY start_date ASC, message_id ASC
            LIMIT $2
            ",
        )
        .bind(queue_id)
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn heartbeat(&self, process_name: &str) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO messenger_heartbeats (process_name, last_beat) VALUES ($1, NOW())
            ON CONFLICT (process_name) DO UPDATE SET last_beat = EXCLUDED.last_beat
            ",
        )
        .bind(process_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_stale_processes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let process_names = sqlx::query_scalar::<_, String>(
            "DELETE FROM messenger_heartbeats WHERE last_beat < $1 RETURNING process_name",
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await?;

        if !process_names.is_empty() {
            sqlx::query(RELEASE_PROCESS_LOCK_SQL)
                .bind(&process_names)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(process_names)
    }

    async fn release_process_lock(&self, process_names: &[String]) -> Result<u64, StorageError> {
        if process_names.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(RELEASE_PROCESS_LOCK_SQL)
            .bind(process_names)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed_messages(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result =
            sqlx::query("DELETE FROM messenger_completed_messages WHERE completed_date < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_failed_messages(
        &self,
        older_than: DateTime<Utc>,
        newer_than: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<FailedMessage>, StorageError> {
        let sql = format!(
            r"
            SELECT {FAILED_COLUMNS}
            FROM messenger_failed_messages
            WHERE failed_date < $1 AND failed_date > $2
            ORDER BY failed_date ASC, failed_message_id ASC
            LIMIT $3
            "
        );

        let messages = sqlx::query_as::<_, FailedMessage>(&sql)
            .bind(older_than)
            .bind(newer_than)
            .bind(i64::try_from(count).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn reenqueue_failed_messages(
        &self,
        queue_id: i64,
        failed_message_ids: &[i64],
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r"
            WITH moved AS (
                DELETE FROM messenger_failed_messages
                WHERE failed_message_id = ANY($2)
                RETURNING failed_message_id, content_type, content, context, identity
            )
            INSERT INTO messenger_messages (queue_id, content_type, content, context, start_date, identity)
            SELECT $1, content_type, content, context, NOW(), identity
            FROM moved
            ORDER BY failed_message_id
            ",
        )
        .bind(queue_id)
        .bind(failed_message_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_messenger_status(&self) -> Result<Vec<MessengerStatus>, StorageError> {
        let status = sqlx::query_as::<_, MessengerStatus>(
            r"
            SELECT 'Ready' AS status, COUNT(*) AS message_count FROM messenger_messages
            UNION ALL
            SELECT 'Completed', COUNT(*) FROM messenger_completed_messages
            UNION ALL
            SELECT 'Failed', COUNT(*) FROM messenger_failed_messages
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(status)
    }

    async fn get_queue_statuses(&self) -> Result<Vec<QueueStatus>, StorageError> {
        let queues = sqlx::query_as::<_, QueueStatus>(
            r"
            SELECT q.queue_id, q.name, q.processed_at, q.processing_started, q.process_name,
                   q.retries, q.next_try_time, q.error, COUNT(m.message_id) AS message_count
            FROM messenger_queues q
            LEFT JOIN messenger_messages m ON m.queue_id = q.queue_id
            GROUP BY q.queue_id
            ORDER BY q.name
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(queues)
    }

    async fn get_active_processes(&self) -> Result<Vec<ProcessStatus>, StorageError> {
        let processes = sqlx::query_as::<_, ProcessStatus>(
            "SELECT process_name, last_beat FROM messenger_heartbeats ORDER BY process_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(processes)
    }

    async fn get_messages(
        &self,
        queue_id: i64,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<MessageDetails>, StorageError> {
        let sql = format!(
            r"
            SELECT {MESSAGE_COLUMNS}
            FROM messenger_messages
            WHERE queue_id = $1
              AND ($2::timestamptz IS NULL OR start_date >= $2)
              AND ($3::timestamptz IS NULL OR start_date < $3)
            ORDER BY start_date ASC, message_id ASC
            LIMIT $4 OFFSET $5
            "
        );

        let messages = sqlx::query_as::<_, MessageDetails>(&sql)
            .bind(queue_id)
            .bind(range.from)
            .bind(range.to)
            .bind(i64::from(page.size))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn get_completed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<CompletedMessage>, StorageError> {
        let sql = format!(
            r"
            SELECT {COMPLETED_COLUMNS}
            FROM messenger_completed_messages
            WHERE ($1::timestamptz IS NULL OR completed_date >= $1)
              AND ($2::timestamptz IS NULL OR completed_date < $2)
            ORDER BY completed_date DESC, completed_message_id DESC
            LIMIT $3 OFFSET $4
            "
        );

        let messages = sqlx::query_as::<_, CompletedMessage>(&sql)
            .bind(range.from)
            .bind(range.to)
            .bind(i64::from(page.size))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn get_failed_messages(
        &self,
        page: Page,
        range: DateRange,
    ) -> Result<Vec<FailedMessage>, StorageError> {
        let sql = format!(
            r"
            SELECT {FAILED_COLUMNS}
            FROM messenger_failed_messages
            WHERE ($1::timestamptz IS NULL OR failed_date >= $1)
              AND ($2::timestamptz IS NULL OR failed_date < $2)
            ORDER BY failed_date DESC, failed_message_id DESC
            LIMIT $3 OFFSET $4
            "
        );

        let messages = sqlx::query_as::<_, FailedMessage>(&sql)
            .bind(range.from)
            .bind(range.to)
            .bind(i64::from(page.size))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<MessageDetails>, StorageError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messenger_messages WHERE message_id = $1");
        let message = sqlx::query_as::<_, MessageDetails>(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    async fn get_completed_message(
        &self,
        completed_message_id: i64,
    ) -> Result<Option<CompletedMessage>, StorageError> {
        let sql = format!(
            "SELECT {COMPLETED_COLUMNS} FROM messenger_completed_messages WHERE completed_message_id = $1"
        );
        let message = sqlx::query_as::<_, CompletedMessage>(&sql)
            .bind(completed_message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    async fn get_failed_message(
        &self,
        failed_message_id: i64,
    ) -> Result<Option<FailedMessage>, StorageError> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM messenger_failed_messages WHERE failed_message_id = $1"
        );
        let message = sqlx::query_as::<_, FailedMessage>(&sql)
            .bind(failed_message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    async fn find_by_identity(&self, identity: Uuid) -> Result<Option<MessageState>, StorageError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messenger_messages WHERE identity = $1 ORDER BY message_id LIMIT 1"
        );
        if let Some(message) = sqlx::query_as::<_, MessageDetails>(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(MessageState::Ready(message)));
        }

        let sql = format!(
            "SELECT {COMPLETED_COLUMNS} FROM messenger_completed_messages WHERE identity = $1 ORDER BY completed_date DESC LIMIT 1"
        );
        if let Some(message) = sqlx::query_as::<_, CompletedMessage>(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(MessageState::Completed(message)));
        }

        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM messenger_failed_messages WHERE identity = $1 ORDER BY failed_date DESC LIMIT 1"
        );
        let message = sqlx::query_as::<_, FailedMessage>(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message.map(MessageState::Failed))
    }
}

const RELEASE_QUEUE_SQL: &str = r"
    UPDATE messenger_queues
    SET processing_started = NULL, process_name = NULL,
        error = NULL, retries = NULL, next_try_time = NULL
    WHERE queue_id = $1
";

const RELEASE_PROCESS_LOCK_SQL: &str = r"
    UPDATE messenger_queues
    SET processing_started = NULL, process_name = NULL, next_try_time = NULL
    WHERE process_name = ANY($1)
";

/// A Postgres transaction scoping the completion of one message.
///
/// `sqlx` rolls the transaction back when it is dropped uncommitted.
struct PgProcessingTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    deadline: Instant,
    failed: bool,
}

impl PgProcessingTransaction {
    fn connection(&mut self) -> Result<&mut Transaction<'static, Postgres>, StorageError> {
        match self.status() {
            TransactionStatus::Active => {}
            status => return Err(StorageError::TransactionClosed(status)),
        }
        self.tx
            .as_mut()
            .ok_or(StorageError::TransactionClosed(TransactionStatus::Committed))
    }

    fn track<T>(&mut self, result: Result<T, sqlx::Error>) -> Result<T, StorageError> {
        if result.is_err() {
            self.failed = true;
        }
        Ok(result?)
    }
}

#[async_trait]
impl ProcessingTransaction for PgProcessingTransaction {
    fn status(&self) -> TransactionStatus {
        if self.tx.is_none() {
            TransactionStatus::Committed
        } else if self.failed || Instant::now() >= self.deadline {
            TransactionStatus::Aborted
        } else {
            TransactionStatus::Active
        }
    }

    async fn remove_message(
        &mut self,
        message_id: i64,
        archive: bool,
    ) -> Result<(), StorageError> {
        let sql = if archive {
            r"
            WITH removed AS (
                DELETE FROM messenger_messages WHERE message_id = $1
                RETURNING content_type, content, context, start_date, identity
            )
            INSERT INTO messenger_completed_messages (content_type, content, context, create_date, completed_date, identity)
            SELECT content_type, content, context, start_date, NOW(), identity FROM removed
            "
        } else {
            "DELETE FROM messenger_messages WHERE message_id = $1"
        };

        let tx = self.connection()?;
        let result = sqlx::query(sql).bind(message_id).execute(&mut **tx).await;
        self.track(result)?;
        Ok(())
    }

    async fn copy_message_to_failed(
        &mut self,
        message_id: i64,
        error: &str,
    ) -> Result<(), StorageError> {
        let tx = self.connection()?;
        let result = sqlx::query(
            r"
            INSERT INTO messenger_failed_messages (content_type, content, context, create_date, failed_date, error, identity)
            SELECT content_type, content, context, start_date, NOW(), $2, identity
            FROM messenger_messages
            WHERE message_id = $1
            ",
        )
        .bind(message_id)
        .bind(error)
        .execute(&mut **tx)
        .await;
        self.track(result)?;
        Ok(())
    }

    async fn move_message_to_end(&mut self, message_id: i64) -> Result<(), StorageError> {
        let tx = self.connection()?;
        let result = sqlx::query(
            "UPDATE messenger_messages SET start_date = clock_timestamp() WHERE message_id = $1",
        )
        .bind(message_id)
        .execute(&mut **tx)
        .await;
        self.track(result)?;
        Ok(())
    }

    async fn release_queue(&mut self, queue_id: i64) -> Result<(), StorageError> {
        let tx = self.connection()?;
        let result = sqlx::query(RELEASE_QUEUE_SQL)
            .bind(queue_id)
            .execute(&mut **tx)
            .await;
        self.track(result)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.connection()?;
        let Some(tx) = self.tx.take() else {
            return Err(StorageError::TransactionClosed(TransactionStatus::Committed));
        };
        tx.commit().await?;
        Ok(())
    }
}
