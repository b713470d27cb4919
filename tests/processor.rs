#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

mod common;

use claims::{assert_matches, assert_none, assert_some};
use common::{TestContext, registry};
use futures_util::future::join_all;
use fatqueue::schema::{DateRange, MessageState, NewMessage, Page, QueueInfo};
use fatqueue::{
    CleanupService, CompletedMessages, JobCall, JobExecutor, JsonSerializer, MemoryRepository,
    MessageProcessor, Messenger, MessengerService, PublishSettings, QueueDecision, Recovery,
    RecoveryMode, Repository,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) struct Setup {
        pub(super) repository: MemoryRepository,
        pub(super) messenger: Messenger<TestContext>,
        pub(super) service: MessengerService,
        pub(super) processor: MessageProcessor<TestContext>,
        pub(super) context: TestContext,
    }

    /// Wire a messenger and a processor to a fresh in-memory repository
    pub(super) fn setup() -> Setup {
        let repository = MemoryRepository::new();
        let registry = Arc::new(registry());
        let context = TestContext::default();

        let messenger = Messenger::new(Arc::new(repository.clone()), registry.clone());
        let service = MessengerService::new(Arc::new(repository.clone()));
        let executor = JobExecutor::new(registry, Arc::new(JsonSerializer));
        let processor =
            MessageProcessor::new(Arc::new(repository.clone()), executor, context.clone())
                .archive_completed(true)
                .failure_backoff(Duration::ZERO);

        Setup {
            repository,
            messenger,
            service,
            processor,
            context,
        }
    }

    impl Setup {
        /// Lock the next queue as a worker would
        pub(super) async fn lock(&self) -> anyhow::Result<Option<QueueInfo>> {
            // Let zero-length backoffs expire
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(self.repository.lock_queue("test-worker").await?)
        }

        /// Lock the next queue and process one batch of it
        pub(super) async fn run_once(&self) -> anyhow::Result<QueueDecision> {
            let queue = assert_some!(self.lock().await?);
            Ok(self.processor.run(&queue, &CancellationToken::new()).await?)
        }

        pub(super) async fn publish(
            &self,
            call: JobCall,
            settings: PublishSettings,
        ) -> anyhow::Result<i64> {
            Ok(assert_some!(self.messenger.publish(call, settings).await?))
        }

        pub(super) async fn queue_retries(&self) -> anyhow::Result<Option<i32>> {
            let queues = self.service.queue_statuses().await?;
            Ok(queues[0].retries)
        }
    }
}

fn record(entry: &str) -> JobCall {
    JobCall::new("recorder", "record").arg(entry)
}

fn fail() -> JobCall {
    JobCall::new("recorder", "fail")
}

#[tokio::test]
async fn a_batch_runs_in_order_and_archives_completed_messages() -> anyhow::Result<()> {
    let setup = test_utils::setup();

    for entry in ["a", "b", "c"] {
        setup.publish(record(entry), PublishSettings::default()).await?;
    }
    setup
        .publish(record("d"), PublishSettings::default().discard_when_complete())
        .await?;

    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_eq!(setup.context.log(), ["a", "b", "c", "d"]);

    let completed = setup
        .service
        .completed_messages(Page::new(1, 10), DateRange::default())
        .await?;
    assert_eq!(completed.len(), 3);

    let queues = setup.service.queue_statuses().await?;
    assert_none!(queues[0].processing_started);
    assert_eq!(queues[0].message_count, 0);

    Ok(())
}

#[tokio::test]
async fn batches_are_limited_to_the_batch_size() -> anyhow::Result<()> {
    let mut setup = test_utils::setup();
    setup.processor = setup.processor.batch_size(2);

    for entry in ["a", "b", "c"] {
        setup.publish(record(entry), PublishSettings::default()).await?;
    }

    setup.run_once().await?;
    assert_eq!(setup.context.log(), ["a", "b"]);
    setup.run_once().await?;
    assert_eq!(setup.context.log(), ["a", "b", "c"]);
    assert_none!(setup.lock().await?);

    Ok(())
}

#[tokio::test]
async fn failures_back_off_until_the_budget_is_spent() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let identity = Uuid::new_v4();
    let message_id = setup
        .publish(fail(), PublishSettings::default().max_retries(2).identity(identity))
        .await?;

    let decision = setup.run_once().await?;
    assert_matches!(decision, QueueDecision::Backoff { retries: 1, .. });
    assert_eq!(setup.queue_retries().await?, Some(1));

    let queues = setup.service.queue_statuses().await?;
    let error = assert_some!(queues[0].error.clone());
    assert!(error.starts_with(&format!("Message [{message_id}] processing failed.")));
    assert!(error.contains("boom"), "{error}");

    let decision = setup.run_once().await?;
    assert_eq!(
        decision,
        QueueDecision::Recover {
            message_id,
            recovery: Recovery::MarkAsFailed,
            retries: 2,
        }
    );
    assert_eq!(setup.context.attempts(), 2);

    // The queue is idle again and the message sits in the failed archive
    assert_none!(setup.queue_retries().await?);
    assert_none!(setup.lock().await?);
    let Some(MessageState::Failed(failed)) = setup.service.find_by_identity(identity).await? else {
        panic!("expected message {identity} in the failed archive");
    };
    assert!(assert_some!(failed.error).contains("boom"));

    Ok(())
}

#[tokio::test]
async fn a_backing_off_queue_is_not_locked() -> anyhow::Result<()> {
    let mut setup = test_utils::setup();
    setup.processor = setup.processor.failure_backoff(Duration::from_secs(3600));

    setup.publish(fail(), PublishSettings::default()).await?;
    assert_matches!(setup.run_once().await?, QueueDecision::Backoff { .. });
    assert_none!(setup.lock().await?);

    Ok(())
}

#[tokio::test]
async fn a_success_in_the_batch_resets_the_failure_streak() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    setup.context.broken.store(true, Ordering::SeqCst);

    setup
        .publish(
            JobCall::new("recorder", "flaky").arg("x"),
            PublishSettings::default().max_retries(10),
        )
        .await?;

    setup.run_once().await?;
    setup.run_once().await?;
    assert_eq!(setup.queue_retries().await?, Some(2));

    setup
        .publish(record("urgent"), PublishSettings::default().highest_priority())
        .await?;
    assert_matches!(
        setup.run_once().await?,
        QueueDecision::Backoff { retries: 1, .. }
    );
    assert_eq!(setup.context.log(), ["urgent"]);

    setup.context.broken.store(false, Ordering::SeqCst);
    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_none!(setup.queue_retries().await?);
    assert_eq!(setup.context.log(), ["urgent", "x"]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_lock_the_same_queue() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    for name in ["alpha", "beta", "gamma", "delta"] {
        setup
            .messenger
            .publish_to(record(name), name, PublishSettings::default())
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(2)).await;

    let attempts = (0..32).map(|worker| {
        let repository = setup.repository.clone();
        tokio::spawn(async move {
            let name = format!("worker-{worker}");
            let queue = repository.lock_queue(&name).await?;
            Ok::<_, fatqueue::StorageError>(queue.map(|queue| (queue.queue_id, name)))
        })
    });
    let mut locked = Vec::new();
    for result in join_all(attempts).await {
        locked.extend(result??);
    }

    assert_eq!(locked.len(), 4);
    let mut queue_ids: Vec<_> = locked.iter().map(|(queue_id, _)| *queue_id).collect();
    queue_ids.sort_unstable();
    queue_ids.dedup();
    assert_eq!(queue_ids.len(), 4);

    for queue in setup.service.queue_statuses().await? {
        let (_, owner) = assert_some!(locked.iter().find(|(id, _)| *id == queue.queue_id));
        assert_eq!(queue.process_name.as_deref(), Some(owner.as_str()));
    }
    assert_none!(setup.repository.lock_queue("late").await?);

    Ok(())
}

#[tokio::test]
async fn delayed_priority_messages_wait_for_their_delay() -> anyhow::Result<()> {
    let setup = test_utils::setup();

    let alone = Uuid::new_v4();
    setup
        .publish(
            record("alone"),
            PublishSettings::default().highest_priority().delay(600).identity(alone),
        )
        .await?;
    assert_none!(setup.lock().await?);
    assert!(setup.messenger.cancel(alone).await?);

    let later = Uuid::new_v4();
    setup.publish(record("now"), PublishSettings::default()).await?;
    setup
        .publish(
            record("later"),
            PublishSettings::default().highest_priority().delay(600).identity(later),
        )
        .await?;

    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_eq!(setup.context.log(), ["now"]);
    assert_none!(setup.lock().await?);

    let Some(MessageState::Ready(message)) = setup.service.find_by_identity(later).await? else {
        panic!("expected message {later} to still be pending");
    };
    assert!(message.start_date > chrono::Utc::now() + chrono::Duration::seconds(500));

    Ok(())
}

#[tokio::test]
async fn make_last_moves_the_failing_message_behind_the_queue() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let settings = PublishSettings::default()
        .max_retries(1)
        .recovery_mode(RecoveryMode::MakeLast);

    let failing = setup.publish(fail(), settings).await?;
    setup.publish(record("next"), PublishSettings::default()).await?;

    assert_matches!(
        setup.run_once().await?,
        QueueDecision::Recover {
            recovery: Recovery::MakeLast,
            ..
        }
    );

    // The other message runs first now, then the failing one fails again
    assert_matches!(
        setup.run_once().await?,
        QueueDecision::Recover {
            message_id,
            retries: 1,
            ..
        } if message_id == failing
    );
    assert_eq!(setup.context.log(), ["next"]);
    assert_some!(setup.service.message(failing).await?);

    Ok(())
}

#[tokio::test]
async fn block_keeps_retrying_the_queue() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let settings = PublishSettings::default()
        .max_retries(1)
        .recovery_mode(RecoveryMode::Block);
    setup.publish(fail(), settings).await?;

    for retries in 1..=3 {
        assert_matches!(
            setup.run_once().await?,
            QueueDecision::Backoff { retries: r, .. } if r == retries
        );
    }

    let failed = setup
        .service
        .failed_messages(Page::new(1, 10), DateRange::default())
        .await?;
    assert!(failed.is_empty());

    Ok(())
}

#[tokio::test]
async fn panics_are_reported_as_failures() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    setup
        .publish(
            JobCall::new("recorder", "panic").arg("kaboom"),
            PublishSettings::default(),
        )
        .await?;

    assert_matches!(setup.run_once().await?, QueueDecision::Backoff { .. });
    let queues = setup.service.queue_statuses().await?;
    let error = assert_some!(queues[0].error.clone());
    assert!(error.contains("job panicked: kaboom"), "{error}");

    Ok(())
}

#[tokio::test]
async fn cancelled_jobs_release_the_queue_without_a_retry() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let message_id = setup
        .publish(JobCall::new("recorder", "cancel"), PublishSettings::default())
        .await?;
    setup.publish(record("after"), PublishSettings::default()).await?;

    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_none!(setup.queue_retries().await?);
    assert_some!(setup.service.message(message_id).await?);
    assert!(setup.context.log().is_empty());

    Ok(())
}

#[tokio::test]
async fn a_cancelled_token_stops_the_batch_before_the_next_message() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    setup.publish(record("a"), PublishSettings::default()).await?;

    let queue = assert_some!(setup.lock().await?);
    let token = CancellationToken::new();
    token.cancel();

    let state = setup.processor.process_queue(&queue, &token).await?;
    assert!(state.cancelled);
    assert_eq!(state.processed, 0);
    assert!(setup.context.log().is_empty());

    Ok(())
}

#[tokio::test]
async fn jobs_exceeding_their_timeout_fail() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let settings = PublishSettings::default()
        .max_retries(1)
        .job_timeout(Duration::from_millis(50));
    let message_id = setup
        .publish(JobCall::new("recorder", "sleep").arg(5_000_u64), settings)
        .await?;

    assert_matches!(setup.run_once().await?, QueueDecision::Recover { .. });
    let failed = assert_some!(
        setup
            .service
            .failed_messages(Page::new(1, 10), DateRange::default())
            .await?
            .into_iter()
            .next()
    );
    let error = assert_some!(failed.error);
    assert!(error.contains(&format!("Message [{message_id}]")), "{error}");
    assert!(error.contains("did not complete within"), "{error}");

    Ok(())
}

#[tokio::test]
async fn messages_without_a_readable_context_use_defaults() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let queue_id = setup.repository.create_queue("raw").await?;

    let content = r#"{"kind":"action","type":"recorder","method":"record","parameter_types":["string"],"arguments":["\"raw\""]}"#;
    let message = |context: Option<&str>| NewMessage {
        queue_id,
        content_type: "recorder".into(),
        content: content.into(),
        context: context.map(str::to_string),
        identity: Uuid::new_v4(),
        deduplicate: false,
    };

    setup.repository.create_message(message(None), Duration::ZERO).await?;
    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_eq!(setup.context.log(), ["raw"]);

    setup
        .repository
        .create_message(message(Some("not json")), Duration::ZERO)
        .await?;
    assert_matches!(
        setup.run_once().await?,
        QueueDecision::Backoff { retries: 1, .. }
    );

    Ok(())
}

#[tokio::test]
async fn blank_and_partial_contexts_use_defaults() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let queue_id = setup.repository.create_queue("raw").await?;

    let contexts = ["", "   ", r#"{"settings":null}"#, r#"{"queue_name":"raw"}"#];
    for (index, context) in contexts.into_iter().enumerate() {
        let entry = format!("raw-{index}");
        setup
            .repository
            .create_message(
                NewMessage {
                    queue_id,
                    content_type: "recorder".into(),
                    content: format!(
                        r#"{{"kind":"action","type":"recorder","method":"record","parameter_types":["string"],"arguments":["\"{entry}\""]}}"#
                    ),
                    context: Some(context.to_string()),
                    identity: Uuid::new_v4(),
                    deduplicate: false,
                },
                Duration::ZERO,
            )
            .await?;

        assert_eq!(setup.run_once().await?, QueueDecision::Release, "{context:?}");
        assert_eq!(setup.context.log().last().map(String::as_str), Some(entry.as_str()));
    }
    assert_eq!(setup.context.log().len(), 4);

    Ok(())
}

#[tokio::test]
async fn unknown_methods_fail_the_message() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    let queue_id = setup.repository.create_queue("legacy").await?;

    setup
        .repository
        .create_message(
            NewMessage {
                queue_id,
                content_type: "recorder".into(),
                content: r#"{"kind":"action","type":"recorder","method":"gone","parameter_types":[],"arguments":[]}"#.into(),
                context: None,
                identity: Uuid::new_v4(),
                deduplicate: false,
            },
            Duration::ZERO,
        )
        .await?;

    assert_matches!(setup.run_once().await?, QueueDecision::Backoff { .. });
    let queues = setup.service.queue_statuses().await?;
    let error = assert_some!(queues[0].error.clone());
    assert!(error.contains("does not contain a method"), "{error}");

    Ok(())
}

#[tokio::test]
async fn inherited_generic_static_and_function_jobs_run() -> anyhow::Result<()> {
    let setup = test_utils::setup();

    setup
        .publish(JobCall::new("square", "draw").arg("box"), PublishSettings::default())
        .await?;
    setup
        .publish(JobCall::new("recorder", "describe").arg(7_i64), PublishSettings::default())
        .await?;
    setup
        .publish(JobCall::new("recorder", "ping"), PublishSettings::default())
        .await?;
    setup
        .messenger
        .publish_function(
            JobCall::new("recorder", "sum").arg(vec![1_i32, 2, 3]),
            "messenger.default",
            PublishSettings::default(),
        )
        .await?;

    assert_eq!(setup.run_once().await?, QueueDecision::Release);
    assert_eq!(setup.context.log(), ["draw:box", "int64:7", "pong", "sum:6"]);

    Ok(())
}

#[tokio::test]
async fn cleanup_purges_the_completed_archive() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    setup.publish(record("a"), PublishSettings::default()).await?;
    setup.run_once().await?;

    let retention = CompletedMessages {
        archive: true,
        cleanup: true,
        clean_older_than: Some(Duration::ZERO),
    };
    let cleaner = CleanupService::new(Arc::new(setup.repository.clone()), retention);
    assert!(cleaner.is_enabled());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(cleaner.cleanup().await?, 1);
    assert_eq!(cleaner.cleanup().await?, 0);

    Ok(())
}

#[tokio::test]
async fn failed_messages_can_be_reenqueued_by_identity() -> anyhow::Result<()> {
    let setup = test_utils::setup();
    setup.context.broken.store(true, Ordering::SeqCst);

    let identity = Uuid::new_v4();
    setup
        .publish(
            JobCall::new("recorder", "flaky").arg("again"),
            PublishSettings::default().max_retries(1).identity(identity),
        )
        .await?;
    assert_matches!(setup.run_once().await?, QueueDecision::Recover { .. });

    setup.context.broken.store(false, Ordering::SeqCst);
    assert_eq!(setup.service.reenqueue_failed(&[identity], None).await?, 1);
    assert_matches!(
        setup.service.find_by_identity(identity).await?,
        Some(MessageState::Ready(_))
    );

    let queue = assert_some!(setup.lock().await?);
    assert_eq!(queue.name, fatqueue::RETRY_FAILED_QUEUE);
    setup
        .processor
        .run(&queue, &CancellationToken::new())
        .await?;
    assert_eq!(setup.context.log(), ["again"]);

    Ok(())
}
