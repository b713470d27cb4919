#![allow(dead_code)]

use fatqueue::{
    Generic, JobCancelled, JobContext, JobRegistry, JobType, MessengerService, Method,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

/// Shared state the test jobs report into.
#[derive(Clone, Default)]
pub struct TestContext {
    pub log: Arc<Mutex<Vec<String>>>,
    pub attempts: Arc<AtomicU32>,
    pub broken: Arc<AtomicBool>,
    pub started: Arc<Notify>,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub busy_queues: Arc<Mutex<HashSet<String>>>,
    pub overlaps: Arc<AtomicUsize>,
}

impl TestContext {
    pub fn push(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub struct Recorder;
pub struct Shape;
pub struct Square;

pub fn registry() -> JobRegistry<TestContext> {
    JobRegistry::default()
        .with(
            JobType::<Recorder, TestContext>::new("recorder")
                .factory(|_| Some(Recorder))
                .method(Method::action(
                    "record",
                    |_: Arc<Recorder>, (entry,): (String,), ctx: JobContext<TestContext>| async move {
                        ctx.context().push(entry);
                        Ok(())
                    },
                ))
                .method(Method::action(
                    "flaky",
                    |_: Arc<Recorder>, (entry,): (String,), ctx: JobContext<TestContext>| async move {
                        let context = ctx.context();
                        context.attempts.fetch_add(1, Ordering::SeqCst);
                        if context.broken.load(Ordering::SeqCst) {
                            anyhow::bail!("service unavailable");
                        }
                        context.push(entry);
                        Ok(())
                    },
                ))
                .method(Method::action(
                    "fail",
                    |_: Arc<Recorder>, (): (), ctx: JobContext<TestContext>| async move {
                        ctx.context().attempts.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("boom")
                    },
                ))
                .method(Method::action(
                    "panic",
                    |_: Arc<Recorder>, (message,): (String,), _: JobContext<TestContext>| async move {
                        assert!(message.is_empty(), "{message}");
                        Ok(())
                    },
                ))
                .method(Method::action(
                    "cancel",
                    |_: Arc<Recorder>, (): (), _: JobContext<TestContext>| async move {
                        Err(JobCancelled.into())
                    },
                ))
                .method(Method::action(
                    "wait_for_cancel",
                    |_: Arc<Recorder>, (): (), ctx: JobContext<TestContext>| async move {
                        ctx.context().started.notify_one();
                        loop {
                            ctx.check_cancelled()?;
                            sleep(Duration::from_millis(10)).await;
                        }
                    },
                ))
                .method(Method::action(
                    "sleep",
                    |_: Arc<Recorder>, (millis,): (u64,), _: JobContext<TestContext>| async move {
                        sleep(Duration::from_millis(millis)).await;
                        Ok(())
                    },
                ))
                .method(Method::action(
                    "slow",
                    |_: Arc<Recorder>, (entry,): (String,), ctx: JobContext<TestContext>| async move {
                        let context = ctx.context();
                        let queue = ctx.queue_scope().current().unwrap_or_default().to_string();

                        if !context.busy_queues.lock().unwrap().insert(queue.clone()) {
                            context.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        let active = context.active.fetch_add(1, Ordering::SeqCst) + 1;
                        context.peak.fetch_max(active, Ordering::SeqCst);

                        sleep(Duration::from_millis(100)).await;

                        context.active.fetch_sub(1, Ordering::SeqCst);
                        context.busy_queues.lock().unwrap().remove(&queue);
                        context.push(entry);
                        Ok(())
                    },
                ))
                .method(Method::action(
                    "describe",
                    |_: Arc<Recorder>, (value,): (Generic,), ctx: JobContext<TestContext>| async move {
                        let type_name = ctx.type_argument("T").unwrap_or("?").to_string();
                        ctx.context().push(format!("{type_name}:{}", value.value()));
                        Ok(())
                    },
                ))
                .method(Method::function(
                    "sum",
                    |_: Arc<Recorder>, (values,): (Vec<i32>,), ctx: JobContext<TestContext>| async move {
                        let sum = values.iter().map(|value| i64::from(*value)).sum::<i64>();
                        ctx.context().push(format!("sum:{sum}"));
                        Ok(sum)
                    },
                ))
                .method(Method::static_action(
                    "ping",
                    |(): (), ctx: JobContext<TestContext>| async move {
                        ctx.context().push("pong");
                        Ok(())
                    },
                )),
        )
        .with(
            JobType::<Shape, TestContext>::new("shape").method(Method::action(
                "draw",
                |_: Arc<Shape>, (name,): (String,), ctx: JobContext<TestContext>| async move {
                    ctx.context().push(format!("draw:{name}"));
                    Ok(())
                },
            )),
        )
        .with(
            JobType::<Square, TestContext>::new("square")
                .inherits("shape", |_: Arc<Square>| Arc::new(Shape))
                .factory(|_| Some(Square)),
        )
}

/// Poll `condition` until it holds, for at most ten seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// `(ready, completed, failed)` message counts.
pub async fn counts(service: &MessengerService) -> anyhow::Result<(i64, i64, i64)> {
    let status = service.status().await?;
    let count = |name: &str| {
        status
            .iter()
            .find(|status| status.status == name)
            .map_or(0, |status| status.message_count)
    };
    Ok((count("Ready"), count("Completed"), count("Failed")))
}

/// Wait until the message counts match `expected`, for at most ten seconds.
pub async fn wait_for_counts(
    service: &MessengerService,
    expected: (i64, i64, i64),
) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let actual = counts(service).await?;
        if actual == expected {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("expected (ready, completed, failed) = {expected:?}, got {actual:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
