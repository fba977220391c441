//! Per-test lifecycle: version gating, client setup, topic readiness, and the
//! teardown leak check.
//!
//! Setup and teardown both short-circuit when no live broker is configured
//! (the `KAFKA_VERSION` environment variable is unset), so a suite runs in a
//! degraded mode on machines without a broker instead of failing. When live,
//! teardown closes the client and then asserts that the scheduler has no
//! pending scheduled work: a nonempty set means the test (or the client's
//! internals) leaked a retry or reconnect timer.
//!
//! The leak check is known to be flaky when a reconnect timer is legitimately
//! in flight at close time; [`LeakPolicy`] makes the tolerated set explicit
//! rather than silently masking it.

use crate::{
    poll, random_string, Error, KafkaClient, OffsetRequest, Scheduler,
};
use rand::RngCore;
use std::{collections::HashMap, env, fmt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable naming the broker version under test.
pub const KAFKA_VERSION_ENV: &str = "KAFKA_VERSION";

/// Timer label the default [`LeakPolicy`] tolerates at teardown.
pub const RECONNECT_LABEL: &str = "reconnect";

/// Why a test is being skipped rather than run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No live broker is configured (`KAFKA_VERSION` unset or empty).
    NoBroker,
    /// A broker is configured but its version is not in the test's supported set.
    UnsupportedVersion(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBroker => write!(f, "no kafka version specified"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported kafka version: {version}")
            }
        }
    }
}

/// Whether a test should run against a live broker.
///
/// Evaluated once per test as a plain predicate; a closed gate routes both
/// setup and teardown into their no-op paths (a skip, distinct from failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Live { version: String },
    Skipped { reason: SkipReason },
}

impl Gate {
    /// Evaluate the gate against an explicit version marker.
    ///
    /// `supported` lists the broker versions the test is written for; the
    /// sentinel `"all"` accepts any present version. An empty marker counts
    /// as absent.
    pub fn evaluate(version: Option<&str>, supported: &[&str]) -> Self {
        let Some(version) = version.filter(|v| !v.is_empty()) else {
            return Self::Skipped {
                reason: SkipReason::NoBroker,
            };
        };
        if supported.contains(&"all") || supported.contains(&version) {
            Self::Live {
                version: version.to_string(),
            }
        } else {
            Self::Skipped {
                reason: SkipReason::UnsupportedVersion(version.to_string()),
            }
        }
    }

    /// Evaluate the gate against the `KAFKA_VERSION` environment variable.
    pub fn from_env(supported: &[&str]) -> Self {
        let version = env::var(KAFKA_VERSION_ENV).ok();
        Self::evaluate(version.as_deref(), supported)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }
}

/// How strictly teardown treats leftover scheduled work.
///
/// A client reconnect timer can legitimately be in flight when a test ends,
/// which makes a fully strict check flaky. The default tolerates (and logs)
/// pending timers labeled [`RECONNECT_LABEL`] and fails on anything else;
/// [`LeakPolicy::Strict`] fails on any pending timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeakPolicy {
    Strict,
    #[default]
    TolerateReconnect,
}

/// Configuration for a [`Harness`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Pre-assigned topic name. When `None`, setup derives a unique one from
    /// the test name and a random suffix.
    pub topic: Option<String>,

    /// Readiness wait parameters.
    pub poll: poll::Config,

    /// Teardown leak-check strictness.
    pub leak: LeakPolicy,
}

/// Per-test lifecycle manager.
///
/// Construct with [`Harness::setup`], use the accessors and helpers from the
/// test body, and finish with [`Harness::teardown`]. A skipped harness (closed
/// [`Gate`]) carries no client and both lifecycle halves are no-ops.
pub struct Harness<C, S>
where
    C: KafkaClient,
    S: Scheduler,
{
    scheduler: S,
    topic: String,
    test_name: String,
    client: Option<C>,
    messages: HashMap<String, String>,
    leak: LeakPolicy,
}

impl<C, S> fmt::Debug for Harness<C, S>
where
    C: KafkaClient,
    S: Scheduler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("topic", &self.topic)
            .field("test_name", &self.test_name)
            .field("live", &self.client.is_some())
            .field("leak", &self.leak)
            .finish_non_exhaustive()
    }
}

impl<C, S> Harness<C, S>
where
    C: KafkaClient,
    S: Scheduler + RngCore,
{
    /// Establish the test's client and wait for its topic to become visible.
    ///
    /// When the gate is closed this returns a degraded harness without
    /// invoking `factory`. Otherwise the topic is the pre-assigned one or
    /// `"{test_name}-{random suffix}"`, the client is built bound to that
    /// topic (the topic doubles as the clientId), and setup blocks until the
    /// broker reports metadata for it or the poll deadline passes.
    pub async fn setup<F>(
        mut scheduler: S,
        gate: Gate,
        test_name: &str,
        mut cfg: Config,
        factory: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce(&str) -> C,
    {
        if let Gate::Skipped { reason } = &gate {
            debug!(%reason, "skipping setup");
            return Ok(Self {
                scheduler,
                topic: cfg.topic.take().unwrap_or_default(),
                test_name: test_name.to_string(),
                client: None,
                messages: HashMap::new(),
                leak: cfg.leak,
            });
        }

        let topic = cfg
            .topic
            .take()
            .unwrap_or_else(|| format!("{}-{}", test_name, random_string(&mut scheduler, 10)));
        let client = factory(&topic);
        poll::wait_for_topic(&scheduler, &client, &topic, cfg.poll).await?;
        Ok(Self {
            scheduler,
            topic,
            test_name: test_name.to_string(),
            client: Some(client),
            messages: HashMap::new(),
            leak: cfg.leak,
        })
    }

    /// Whether setup ran against a live broker (false when skipped).
    pub fn is_live(&self) -> bool {
        self.client.is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client(&self) -> Option<&C> {
        self.client.as_ref()
    }

    /// Close the client and assert no scheduled work was leaked.
    ///
    /// Every pending timer is logged before the check fails, so a flaky
    /// failure still leaves enough to diagnose. See [`LeakPolicy`] for what
    /// is tolerated.
    pub async fn teardown(mut self) -> Result<(), Error> {
        let Some(client) = self.client.take() else {
            debug!("skipping teardown");
            return Ok(());
        };
        client.close().await?;

        let pending = self.scheduler.delayed_calls();
        if pending.is_empty() {
            return Ok(());
        }
        for call in &pending {
            warn!(
                id = call.id,
                label = %call.label,
                deadline = ?call.deadline,
                "delayed call still scheduled at teardown"
            );
        }
        let offending = match self.leak {
            LeakPolicy::Strict => pending.len(),
            LeakPolicy::TolerateReconnect => pending
                .iter()
                .filter(|call| call.label != RECONNECT_LABEL)
                .count(),
        };
        if offending > 0 {
            return Err(Error::LeakedTimers(offending));
        }
        Ok(())
    }

    /// Latest offset for a partition of the test's topic.
    pub async fn current_offset(&self, partition: i32) -> Result<i64, Error> {
        let client = self.client.as_ref().ok_or(Error::ClientClosed)?;
        let responses = client
            .send_offset_request(&[OffsetRequest {
                topic: self.topic.clone(),
                partition,
                time: -1,
                max_offsets: 1,
            }])
            .await?;
        responses
            .first()
            .and_then(|response| response.offsets.first())
            .copied()
            .ok_or(Error::OffsetsUnavailable {
                topic: self.topic.clone(),
                partition,
            })
    }

    /// A payload for the logical key, generated once and memoized.
    ///
    /// Repeated calls with the same key return the same payload within one
    /// test, while distinct tests (and distinct keys) never collide.
    pub fn msg(&mut self, key: &str) -> String {
        let test_name = &self.test_name;
        self.messages
            .entry(key.to_string())
            .or_insert_with(|| format!("{}-{}-{}", key, test_name, Uuid::new_v4()))
            .clone()
    }

    /// Payloads for a batch of logical keys.
    pub fn msgs(&mut self, keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| self.msg(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deterministic::Executor, mocks};
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[test]
    fn test_gate_absent_version_skips() {
        let gate = Gate::evaluate(None, &["all"]);
        assert_eq!(
            gate,
            Gate::Skipped {
                reason: SkipReason::NoBroker
            }
        );
        assert!(!gate.is_live());
    }

    #[test]
    fn test_gate_empty_version_counts_as_absent() {
        let gate = Gate::evaluate(Some(""), &["all"]);
        assert_eq!(
            gate,
            Gate::Skipped {
                reason: SkipReason::NoBroker
            }
        );
    }

    #[test]
    fn test_gate_unsupported_version_skips() {
        let gate = Gate::evaluate(Some("0.7.0"), &["0.8.0", "0.8.1"]);
        assert_eq!(
            gate,
            Gate::Skipped {
                reason: SkipReason::UnsupportedVersion("0.7.0".to_string())
            }
        );
    }

    #[test]
    fn test_gate_supported_and_all() {
        assert!(Gate::evaluate(Some("0.8.1"), &["0.8.0", "0.8.1"]).is_live());
        assert!(Gate::evaluate(Some("3.7.0"), &["all"]).is_live());
    }

    #[test]
    fn test_skipped_lifecycle_builds_no_client() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let built = Arc::new(Mutex::new(false));
            let harness = Harness::setup(
                context,
                Gate::evaluate(None, &["all"]),
                "skip_case",
                Config::default(),
                {
                    let built = built.clone();
                    move |_topic: &str| {
                        *built.lock().unwrap() = true;
                        mocks::Client::ready_after(1)
                    }
                },
            )
            .await
            .unwrap();

            assert!(!harness.is_live());
            harness.teardown().await.unwrap();
            assert!(!*built.lock().unwrap());
        });
    }

    #[test]
    fn test_live_lifecycle() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let client = mocks::Client::ready_after(2).with_offsets(vec![42]);
            let mut harness = Harness::setup(
                context.clone(),
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "live_case",
                Config::default(),
                |_topic: &str| client.clone(),
            )
            .await
            .unwrap();

            assert!(harness.is_live());
            assert!(harness.topic().starts_with("live_case-"));
            assert_eq!(harness.topic().len(), "live_case-".len() + 10);

            // Memoized payloads: stable per key, distinct across keys.
            let first = harness.msg("a");
            assert_eq!(harness.msg("a"), first);
            assert_ne!(harness.msg("b"), first);
            assert!(first.starts_with("a-live_case-"));
            assert_eq!(harness.msgs(&["a", "b"]), vec![
                harness.msg("a"),
                harness.msg("b")
            ]);

            assert_eq!(harness.current_offset(0).await.unwrap(), 42);

            harness.teardown().await.unwrap();
            assert!(client.is_closed());
            assert!(context.delayed_calls().is_empty());
        });
    }

    #[test]
    fn test_preassigned_topic_is_kept() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let cfg = Config {
                topic: Some("fixed-topic".to_string()),
                ..Config::default()
            };
            let harness = Harness::setup(
                context,
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "named_case",
                cfg,
                |_topic: &str| mocks::Client::ready_after(1),
            )
            .await
            .unwrap();
            assert_eq!(harness.topic(), "fixed-topic");
            harness.teardown().await.unwrap();
        });
    }

    #[test]
    fn test_setup_fails_when_topic_never_ready() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let cfg = Config {
                poll: poll::Config {
                    interval: Duration::from_millis(10),
                    timeout: Duration::from_millis(50),
                },
                ..Config::default()
            };
            let err = Harness::setup(
                context,
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "stuck_case",
                cfg,
                |_topic: &str| mocks::Client::never_ready(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, Error::TopicNotReady { .. }));
        });
    }

    #[test]
    fn test_teardown_fails_on_leaked_timer() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let harness = Harness::setup(
                context.clone(),
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "leaky_case",
                Config::default(),
                |_topic: &str| mocks::Client::ready_after(1),
            )
            .await
            .unwrap();

            let _stray = context.call_later("stray", Duration::from_secs(60));
            let err = harness.teardown().await.unwrap_err();
            assert!(matches!(err, Error::LeakedTimers(1)));
        });
    }

    #[test]
    fn test_teardown_tolerates_reconnect_timer() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let harness = Harness::setup(
                context.clone(),
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "reconnect_case",
                Config::default(),
                |_topic: &str| mocks::Client::ready_after(1),
            )
            .await
            .unwrap();

            let _reconnect = context.call_later(RECONNECT_LABEL, Duration::from_secs(60));
            harness.teardown().await.unwrap();
        });
    }

    #[test]
    fn test_strict_teardown_rejects_reconnect_timer() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let cfg = Config {
                leak: LeakPolicy::Strict,
                ..Config::default()
            };
            let harness = Harness::setup(
                context.clone(),
                Gate::evaluate(Some("0.8.1"), &["all"]),
                "strict_case",
                cfg,
                |_topic: &str| mocks::Client::ready_after(1),
            )
            .await
            .unwrap();

            let _reconnect = context.call_later(RECONNECT_LABEL, Duration::from_secs(60));
            let err = harness.teardown().await.unwrap_err();
            assert!(matches!(err, Error::LeakedTimers(1)));
        });
    }
}
