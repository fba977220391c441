//! Deterministic test scaffolding for asynchronous Kafka clients.
//!
//! Integration tests against a broker topic that is created lazily (a metadata
//! query for an unknown topic auto-creates it on default broker configurations)
//! need three things: a cooperative scheduler whose pending timers can be
//! inspected, a bounded retry loop that waits for the topic's metadata to
//! appear, and a teardown check that no timer work was left scheduled. This
//! crate provides all three, plus the per-test lifecycle ([`harness`]) and a
//! scoped elapsed-time measurement ([`stopwatch`]) used directly by test
//! bodies.
//!
//! The `deterministic` module provides a single-threaded scheduler that allows
//! for reproducible execution of tasks (given a fixed seed). Real clients are
//! reached only through the [`KafkaClient`] trait; [`mocks`] provides a
//! configurable stand-in.
//!
//! # Example
//!
//! ```rust
//! use kafka_testkit::{deterministic::Executor, mocks, poll, Scheduler};
//!
//! let (runner, context) = Executor::default();
//! runner.start(async move {
//!     // The topic becomes visible on the third metadata load.
//!     let client = mocks::Client::ready_after(3);
//!     poll::wait_for_topic(&context, &client, "orders", poll::Config::default())
//!         .await
//!         .expect("topic never became visible");
//!
//!     // The retry timers all fired; nothing is left scheduled.
//!     assert!(context.delayed_calls().is_empty());
//! });
//! ```

use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod deterministic;
pub mod harness;
pub mod mocks;
pub mod poll;
pub mod stopwatch;
mod utils;
pub use utils::*;

/// Prefix for scheduler metrics.
const METRICS_PREFIX: &str = "testkit";

/// Errors that can occur when interacting with the testkit.
#[derive(Error, Debug)]
pub enum Error {
    #[error("topic not ready after {elapsed:?}: {topic}")]
    TopicNotReady { topic: String, elapsed: Duration },
    #[error("{0} delayed calls still scheduled at teardown")]
    LeakedTimers(usize),
    #[error("no offsets returned for {topic}[{partition}]")]
    OffsetsUnavailable { topic: String, partition: i32 },
    #[error("client closed")]
    ClientClosed,
    #[error("metadata fetch failed: {0}")]
    Metadata(String),
    #[error("closed")]
    Closed,
}

/// Result of awaiting a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The timer's duration elapsed.
    Elapsed,
    /// The timer was cancelled before it could fire.
    Cancelled,
}

/// Snapshot of one scheduled-but-unfired timer.
///
/// The set of all `PendingCall`s is the scheduler's outstanding work: a
/// test that ends with this set nonempty has leaked a retry or reconnect
/// timer. The `label` identifies who scheduled the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub id: u64,
    pub label: String,
    pub deadline: SystemTime,
}

/// Interface that any scheduler must implement to provide cancellable,
/// inspectable timed work.
///
/// All timers are single-shot. Every timer created through [`Scheduler::call_later`]
/// is tracked until it fires, is cancelled, or its future is dropped, so
/// [`Scheduler::delayed_calls`] is an exact snapshot of outstanding work at any
/// point between polls.
pub trait Scheduler: Clone + Send + Sync + 'static {
    /// The type of [Timer] returned by [Scheduler::call_later].
    type Timer: Timer;

    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Schedule a single-shot timer that fires after `delay`.
    ///
    /// The timer is registered immediately (not on first poll), so it is
    /// visible to [`Scheduler::delayed_calls`] as soon as this returns.
    fn call_later(&self, label: &str, delay: Duration) -> Self::Timer;

    /// Snapshot of all timers that have been scheduled but have not yet
    /// fired or been cancelled.
    fn delayed_calls(&self) -> Vec<PendingCall>;
}

/// A single-shot timer produced by [`Scheduler::call_later`].
///
/// Resolves to [`TimerOutcome::Elapsed`] when its duration passes, or to
/// [`TimerOutcome::Cancelled`] if cancelled first. Dropping an unfired timer
/// removes it from the scheduler's pending set.
pub trait Timer: Future<Output = TimerOutcome> + Send + Unpin + 'static {
    /// The type of [Canceller] used to cancel this timer.
    type Canceller: Canceller;

    /// Returns a handle that can cancel this timer before it fires.
    fn canceller(&self) -> Self::Canceller;
}

/// Handle used to cancel an in-flight [`Timer`].
pub trait Canceller: Clone + Send + Sync + 'static {
    /// Cancel the timer.
    ///
    /// Removal from the scheduler's pending set happens synchronously: the
    /// timer is absent from [`Scheduler::delayed_calls`] by the time this
    /// returns. Cancelling a timer that already fired (or was already
    /// cancelled) is a no-op.
    fn cancel(&self);
}

/// A single offset query, addressed to one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRequest {
    pub topic: String,
    pub partition: i32,
    /// Target time: `-1` for the latest offset, `-2` for the earliest.
    pub time: i64,
    pub max_offsets: u32,
}

/// Offsets returned for one [`OffsetRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetResponse {
    pub topic: String,
    pub partition: i32,
    pub offsets: Vec<i64>,
}

/// Interface to the broker client under test.
///
/// The testkit owns none of the client's protocol handling; it only needs
/// metadata refresh/lookup (to wait for lazy topic creation), offset queries
/// (for test assertions), and a clean close.
pub trait KafkaClient: Send + Sync + 'static {
    /// Request metadata for a topic from the broker.
    ///
    /// On default broker configurations this auto-creates the topic if it
    /// does not exist yet.
    fn load_metadata_for_topics(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Whether metadata for the topic is currently known to the client.
    fn has_metadata_for_topic(&self, topic: &str) -> bool;

    /// Query offsets for the given topic partitions.
    fn send_offset_request(
        &self,
        requests: &[OffsetRequest],
    ) -> impl Future<Output = Result<Vec<OffsetResponse>, Error>> + Send;

    /// Close the client, releasing any connections and pending work.
    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send;
}
