use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::Rng;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::fmt::Write as _;
use std::panic::PanicHookInfo;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `callback` inside a sentry transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: AsyncFnOnce() -> Result<R, E>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "messenger.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Try to figure out what's in the box, and print it if we can.
///
/// The actual error type we will get from `panic::catch_unwind` is really poorly documented.
/// However, the `panic::set_hook` functions deal with a `PanicHookInfo` type, and its payload is
/// documented as "commonly but not always `&'static str` or `String`". So we can try all of those,
/// and give up if we didn't get one of those three types.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(x) = info.downcast_ref::<PanicHookInfo<'static>>() {
        anyhow!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {x}")
    } else {
        anyhow!("job panicked")
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `false` when the sleep was cut short.
pub(crate) async fn sleep_or_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = token.cancelled() => false,
    }
}

/// `interval` stretched by a random share of `jitter`, so that idle workers
/// do not poll in lockstep.
pub(crate) fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let share: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    interval.saturating_add(jitter.mul_f64(share))
}

/// `now - age`, saturating at the earliest representable time.
pub(crate) fn time_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + delay`, saturating at the latest representable time.
pub(crate) fn time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Error text stored on queues and failed messages.
pub(crate) fn format_error(error: &(dyn std::error::Error + 'static), message_id: Option<i64>) -> String {
    let mut text = String::new();
    if let Some(message_id) = message_id {
        let _ = writeln!(text, "Message [{message_id}] processing failed.");
    }

    let _ = write!(text, "{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(text, "\n  caused by: {cause}");
        source = cause.source();
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobError;

    #[test]
    fn formatted_errors_name_the_message_and_the_causes() {
        let error = JobError::Invocation(anyhow!("boom").context("while sending"));
        let text = format_error(&error, Some(42));
        assert!(text.starts_with("Message [42] processing failed.\n"));
        assert!(text.contains("while sending"));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("oh no");
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: oh no"
        );
    }

    #[test]
    fn jitter_only_ever_lengthens_the_interval() {
        let interval = Duration::from_millis(500);
        assert_eq!(jittered(interval, Duration::ZERO), interval);

        for _ in 0..100 {
            let delay = jittered(interval, Duration::from_millis(250));
            assert!(delay >= interval, "{delay:?}");
            assert!(delay <= Duration::from_millis(750), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn cancelled_sleeps_return_early() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_or_cancelled(Duration::from_secs(60), &token).await);
    }
}
