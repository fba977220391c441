//! Bounded wait for an externally-observed condition.
//!
//! The pattern this module exists for: an operation triggers lazy creation of
//! a server-side resource (querying metadata for an unknown topic auto-creates
//! it on default broker configurations), and the test must not proceed until
//! the resource is actually visible. [`wait_until`] retries a refresh action
//! at a fixed interval until a readiness predicate holds, bounded by an
//! absolute deadline computed once at the start of the wait.

use crate::{Error, KafkaClient, Scheduler};
use std::{future::Future, time::Duration};

/// Configuration for a bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Delay between retry cycles.
    pub interval: Duration,

    /// Total time budget for the wait, measured from its start.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Wait until `ready` holds, re-running `refresh` between checks.
///
/// The refresh action runs exactly once before the first predicate check and
/// exactly once per retry cycle, so the number of refreshes always equals the
/// number of predicate checks. A resource that is ready after the first
/// refresh succeeds without any delay elapsing. The deadline is only consulted
/// after a delay has elapsed, and a wait that exceeds it fails with
/// [`Error::TopicNotReady`] carrying `resource` and the elapsed time.
///
/// Must be called from within the scheduler's execution context. Concurrent
/// waits for multiple resources are independent calls; one call never
/// overlaps its own cycles.
pub async fn wait_until<S, R, F, P>(
    scheduler: &S,
    resource: &str,
    cfg: Config,
    mut refresh: R,
    mut ready: P,
) -> Result<(), Error>
where
    S: Scheduler,
    R: FnMut() -> F,
    F: Future<Output = Result<(), Error>>,
    P: FnMut() -> bool,
{
    let start = scheduler.current();
    let deadline = start
        .checked_add(cfg.timeout)
        .expect("overflow when setting deadline");
    refresh().await?;
    loop {
        if ready() {
            return Ok(());
        }
        let _ = scheduler.call_later("poll", cfg.interval).await;
        if scheduler.current() > deadline {
            let elapsed = scheduler
                .current()
                .duration_since(start)
                .unwrap_or_default();
            return Err(Error::TopicNotReady {
                topic: resource.to_string(),
                elapsed,
            });
        }
        refresh().await?;
    }
}

/// Wait until the broker reports metadata for `topic`.
///
/// The initial metadata load doubles as the creation trigger: on default
/// broker configurations, querying for an unknown topic auto-creates it.
pub async fn wait_for_topic<S, C>(
    scheduler: &S,
    client: &C,
    topic: &str,
    cfg: Config,
) -> Result<(), Error>
where
    S: Scheduler,
    C: KafkaClient,
{
    wait_until(
        scheduler,
        topic,
        cfg,
        || client.load_metadata_for_topics(topic),
        || client.has_metadata_for_topic(topic),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deterministic::Executor, mocks};
    use std::time::Duration;

    #[test]
    fn test_ready_after_first_refresh_takes_no_delay() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let client = mocks::Client::ready_after(1);
            let start = context.current();
            wait_for_topic(&context, &client, "orders", Config::default())
                .await
                .unwrap();

            // Zero retries: no delay elapsed, one refresh, one check.
            assert_eq!(context.current(), start);
            assert_eq!(client.metadata_loads(), 1);
            assert_eq!(client.metadata_checks(), 1);
            assert!(context.delayed_calls().is_empty());
        });
    }

    #[test]
    fn test_ready_on_third_check() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let client = mocks::Client::ready_after(3);
            let start = context.current();
            wait_for_topic(&context, &client, "orders", Config::default())
                .await
                .unwrap();

            // Exactly two retry delays of the default 10ms interval.
            let elapsed = context.current().duration_since(start).unwrap();
            assert_eq!(elapsed, Duration::from_millis(20));
            assert_eq!(client.metadata_loads(), 3);
            assert_eq!(client.metadata_checks(), 3);
            assert!(context.delayed_calls().is_empty());
        });
    }

    #[test]
    fn test_never_ready_times_out() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let client = mocks::Client::never_ready();
            let cfg = Config {
                interval: Duration::from_millis(10),
                timeout: Duration::from_millis(50),
            };
            let start = context.current();
            let err = wait_for_topic(&context, &client, "orders", cfg)
                .await
                .unwrap_err();

            match err {
                Error::TopicNotReady { topic, elapsed } => {
                    assert_eq!(topic, "orders");
                    assert!(elapsed >= cfg.timeout);
                }
                other => panic!("unexpected error: {other:?}"),
            }

            // Never earlier than the timeout.
            let elapsed = context.current().duration_since(start).unwrap();
            assert!(elapsed >= cfg.timeout);
            // Refresh count still matches check count when the wait fails.
            assert_eq!(client.metadata_loads(), client.metadata_checks());
            assert!(context.delayed_calls().is_empty());
        });
    }

    #[test]
    fn test_refresh_failure_propagates() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let client = mocks::Client::failing_metadata("broker unavailable");
            let err = wait_for_topic(&context, &client, "orders", Config::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Metadata(reason) if reason == "broker unavailable"));
        });
    }

    #[test]
    fn test_refresh_count_matches_check_count() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            for ready_after in 1usize..6 {
                let client = mocks::Client::ready_after(ready_after);
                wait_for_topic(&context, &client, "orders", Config::default())
                    .await
                    .unwrap();
                assert_eq!(client.metadata_loads(), ready_after);
                assert_eq!(client.metadata_checks(), ready_after);
            }
        });
    }
}
