#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

mod common;

use claims::{assert_matches, assert_none, assert_ok, assert_some};
use common::{TestContext, registry};
use fatqueue::schema::{DateRange, MessageState, Page};
use fatqueue::{
    Arg, JobCall, JobDescriptor, JobError, JobKind, MemoryRepository, MessageContext, Messenger,
    MessengerService, PublishError, PublishSettings, QueueCache, QueueScope, QueueTarget,
    RecoveryMode,
};
use insta::assert_compact_json_snapshot;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Create a messenger and an admin service over a fresh in-memory repository
    pub(super) fn setup() -> (Messenger<TestContext>, MessengerService) {
        let repository = Arc::new(MemoryRepository::new());
        let messenger = Messenger::new(repository.clone(), Arc::new(registry()));
        let service = MessengerService::new(repository);
        (messenger, service)
    }

    /// Names of all queues that exist
    pub(super) async fn queue_names(service: &MessengerService) -> anyhow::Result<Vec<String>> {
        Ok(service
            .queue_statuses()
            .await?
            .into_iter()
            .map(|queue| queue.name)
            .collect())
    }

    /// Contents of the pending messages of the queue `name`, in execution order
    pub(super) async fn pending(
        service: &MessengerService,
        name: &str,
    ) -> anyhow::Result<Vec<JobDescriptor>> {
        let queue = service
            .queue_statuses()
            .await?
            .into_iter()
            .find(|queue| queue.name == name)
            .ok_or_else(|| anyhow::anyhow!("queue {name} does not exist"))?;

        service
            .messages(queue.queue_id, Page::new(1, 100), DateRange::default())
            .await?
            .into_iter()
            .map(|message| Ok(JobDescriptor::from_content(&message.content)?))
            .collect()
    }
}

fn record(entry: &str) -> JobCall {
    JobCall::new("recorder", "record").arg(entry)
}

#[tokio::test]
async fn published_messages_carry_a_replayable_descriptor() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();

    let call = JobCall::new("recorder", "sum").arg(Arg::sequence([1, 2]));
    let message_id = assert_some!(
        messenger
            .publish_function(call, "math", PublishSettings::default())
            .await?
    );

    let message = assert_some!(service.message(message_id).await?);
    assert_eq!(message.content_type, "recorder");

    let descriptor = JobDescriptor::from_content(&message.content)?;
    assert_eq!(descriptor.kind(), JobKind::Function);
    assert_compact_json_snapshot!(descriptor, @r#"{"kind": "function", "type": "recorder", "method": "sum", "parameter_types": ["list<int32>"], "arguments": ["[1,2]"]}"#);

    let context: MessageContext = serde_json::from_str(&assert_some!(message.context))?;
    assert_eq!(context.queue_name, "math");
    assert_eq!(context.settings, Some(PublishSettings::default()));

    Ok(())
}

#[tokio::test]
async fn scopes_override_call_site_queue_names() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();
    let settings = PublishSettings::default;

    messenger.publish(record("a"), settings()).await?;
    messenger.publish_to(record("b"), "explicit", settings()).await?;

    let scoped = messenger.enter_scope("scoped");
    scoped.publish_to(record("c"), "explicit", settings()).await?;
    scoped
        .publish_to(record("d"), QueueTarget::exactly("pinned"), settings())
        .await?;
    scoped
        .in_scope(&QueueScope::root())
        .publish(record("e"), settings())
        .await?;

    let mut names = test_utils::queue_names(&service).await?;
    names.sort();
    assert_eq!(names, ["explicit", "messenger.default", "pinned", "scoped"]);

    let messages = test_utils::pending(&service, "messenger.default").await?;
    assert_eq!(messages.len(), 2);

    Ok(())
}

#[tokio::test]
async fn deleted_queues_are_recreated_on_the_next_publish() -> anyhow::Result<()> {
    let repository = Arc::new(MemoryRepository::new());
    let queues = Arc::new(QueueCache::new());
    let messenger = Messenger::<TestContext>::new(repository.clone(), Arc::new(registry()))
        .with_queue_cache(queues.clone());
    let service = MessengerService::new(repository).with_queue_cache(queues);

    let identity = Uuid::new_v4();
    messenger
        .publish_to(record("a"), "reports", PublishSettings::default().identity(identity))
        .await?;
    assert_eq!(test_utils::queue_names(&service).await?, ["reports"]);

    assert!(service.delete_queue("reports").await?);
    assert!(test_utils::queue_names(&service).await?.is_empty());
    assert_none!(service.find_by_identity(identity).await?);
    assert!(!service.delete_queue("reports").await?);

    assert_some!(
        messenger
            .publish_to(record("b"), "reports", PublishSettings::default())
            .await?
    );
    assert_eq!(test_utils::pending(&service, "reports").await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn the_default_queue_resolver_applies_when_nothing_is_named() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();
    let messenger =
        messenger.with_default_queue_name(|type_name| Some(format!("{type_name}.jobs")));

    messenger.publish(record("a"), PublishSettings::default()).await?;
    messenger
        .publish_to(record("b"), "  ", PublishSettings::default())
        .await?;

    assert_eq!(test_utils::queue_names(&service).await?, ["recorder.jobs"]);
    assert_eq!(test_utils::pending(&service, "recorder.jobs").await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn identities_make_publishing_idempotent() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();
    let identity = Uuid::new_v4();
    let settings = PublishSettings::default().identity(identity);

    assert_some!(messenger.publish(record("a"), settings.clone()).await?);
    assert_none!(messenger.publish(record("a"), settings).await?);

    // Without an identity every publish creates a message
    assert_some!(messenger.publish(record("a"), PublishSettings::default()).await?);
    assert_some!(messenger.publish(record("a"), PublishSettings::default()).await?);

    assert_eq!(test_utils::pending(&service, "messenger.default").await?.len(), 3);
    assert_matches!(
        service.find_by_identity(identity).await?,
        Some(MessageState::Ready(_))
    );

    Ok(())
}

#[tokio::test]
async fn priority_messages_run_before_waiting_ones() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();

    messenger.publish(record("first"), PublishSettings::default()).await?;
    messenger.publish(record("second"), PublishSettings::default()).await?;
    messenger
        .publish(record("urgent"), PublishSettings::default().highest_priority())
        .await?;

    let entries: Vec<_> = test_utils::pending(&service, "messenger.default")
        .await?
        .into_iter()
        .map(|descriptor| descriptor.invocation().arguments[0].clone().unwrap())
        .collect();
    assert_eq!(entries, [r#""urgent""#, r#""first""#, r#""second""#]);

    Ok(())
}

#[tokio::test]
async fn only_messages_that_have_not_started_can_be_cancelled() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();

    let delayed = Uuid::new_v4();
    messenger
        .publish(record("later"), PublishSettings::default().identity(delayed).delay(3600))
        .await?;
    let eligible = Uuid::new_v4();
    messenger
        .publish(record("now"), PublishSettings::default().identity(eligible))
        .await?;

    assert!(messenger.cancel(delayed).await?);
    assert!(!messenger.cancel(delayed).await?);
    assert_none!(service.find_by_identity(delayed).await?);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!messenger.cancel(eligible).await?);
    assert_some!(service.find_by_identity(eligible).await?);

    Ok(())
}

#[tokio::test]
async fn rejected_calls_leave_no_trace() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();
    let evaluated = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let flag = evaluated.clone();
    let call = JobCall::new("recorder", "record").arg(Arg::eval(move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        42_i32
    }));
    let error = messenger
        .publish(call, PublishSettings::default())
        .await
        .unwrap_err();
    assert_matches!(error, PublishError::Job(JobError::Encode { .. }));

    assert!(!evaluated.load(std::sync::atomic::Ordering::SeqCst));
    assert!(test_utils::queue_names(&service).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn actions_cannot_be_published_as_functions() -> anyhow::Result<()> {
    let (messenger, _service) = test_utils::setup();

    let error = messenger
        .publish_function(record("a"), "math", PublishSettings::default())
        .await
        .unwrap_err();
    assert_matches!(error, PublishError::Job(JobError::Encode { .. }));

    // Functions can still be published as plain messages; the result is discarded
    let call = JobCall::new("recorder", "sum").arg(vec![1_i32]);
    assert_ok!(messenger.publish(call, PublishSettings::default()).await);

    Ok(())
}

#[tokio::test]
async fn generic_parameters_are_closed_with_the_argument_type() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();

    messenger
        .publish(
            JobCall::new("recorder", "describe").arg(7_i64),
            PublishSettings::default(),
        )
        .await?;

    let error = messenger
        .publish(
            JobCall::new("recorder", "describe").arg(Arg::untyped(serde_json::json!(7))),
            PublishSettings::default(),
        )
        .await
        .unwrap_err();
    assert_matches!(error, PublishError::Job(JobError::Encode { .. }));

    let messages = test_utils::pending(&service, "messenger.default").await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].invocation().parameter_types, ["int64"]);

    Ok(())
}

#[tokio::test]
async fn inherited_methods_can_be_published_on_derived_types() -> anyhow::Result<()> {
    let (messenger, service) = test_utils::setup();

    let settings = PublishSettings::default().recovery_mode(RecoveryMode::MakeLast);
    messenger
        .publish(JobCall::new("square", "draw").arg("box"), settings)
        .await?;

    let messages = test_utils::pending(&service, "messenger.default").await?;
    assert_eq!(messages[0].invocation().type_name, "square");
    assert_eq!(messages[0].invocation().parameter_types, ["string"]);

    Ok(())
}
