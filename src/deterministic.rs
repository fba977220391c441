//! A deterministic scheduler that randomly selects tasks to run based on a seed.
//!
//! Time is virtual: it advances by a fixed `cycle` after each iteration of the
//! event loop and jumps straight to the next timer deadline when no task is
//! runnable, so a test that sleeps for five seconds completes in microseconds.
//! Every timer created through [`crate::Scheduler::call_later`] stays in the
//! pending table until it fires, is cancelled, or its future is dropped, which
//! makes [`crate::Scheduler::delayed_calls`] an exact leak report.
//!
//! # Panics
//!
//! If any task panics, the scheduler will panic (and shutdown).
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use kafka_testkit::{deterministic::Executor, Scheduler, TimerOutcome};
//!
//! let (runner, context) = Executor::default();
//! let outcome = runner.start(async move {
//!     context.call_later("tick", Duration::from_millis(5)).await
//! });
//! assert_eq!(outcome, TimerOutcome::Elapsed);
//! ```

use crate::{utils::Handle, PendingCall, TimerOutcome, METRICS_PREFIX};
use futures::task::{waker_ref, ArcWake};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use rand::{prelude::SliceRandom, rngs::StdRng, RngCore, SeedableRng};
use std::{
    collections::BTreeMap,
    future::Future,
    mem::replace,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll, Waker},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,

    timers_scheduled: Family<Work, Counter>,
    timers_fired: Counter,
    timers_cancelled: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            task_polls: Family::default(),
            timers_scheduled: Family::default(),
            timers_fired: Counter::default(),
            timers_cancelled: Counter::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        registry.register(
            "timers_scheduled",
            "Total number of timers scheduled",
            metrics.timers_scheduled.clone(),
        );
        registry.register(
            "timers_fired",
            "Total number of timers that fired",
            metrics.timers_fired.clone(),
        );
        registry.register(
            "timers_cancelled",
            "Total number of timers cancelled before firing",
            metrics.timers_cancelled.clone(),
        );
        metrics
    }
}

enum TimerState {
    Pending(Option<Waker>),
    Fired,
    Cancelled,
}

struct TimerEntry {
    id: u64,
    label: String,
    deadline: SystemTime,
    state: Mutex<TimerState>,
}

impl TimerEntry {
    /// Move a pending timer to `next`, handing back any registered waker.
    ///
    /// Returns `None` if the timer already left the pending state, so firing,
    /// cancellation, and drop race benignly: only one transition wins.
    fn finish(&self, next: TimerState) -> Option<Option<Waker>> {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, TimerState::Pending(_)) {
            return None;
        }
        match replace(&mut *state, next) {
            TimerState::Pending(waker) => Some(waker),
            _ => unreachable!(),
        }
    }
}

/// The scheduled-work table: all timers created and not yet fired, cancelled,
/// or dropped.
struct Timers {
    counter: Mutex<u64>,
    entries: Mutex<BTreeMap<u64, Arc<TimerEntry>>>,
}

impl Timers {
    fn register(&self, label: &str, deadline: SystemTime) -> Arc<TimerEntry> {
        let id = {
            let mut counter = self.counter.lock().unwrap();
            let id = *counter;
            *counter = counter.checked_add(1).expect("timer counter overflow");
            id
        };
        let entry = Arc::new(TimerEntry {
            id,
            label: label.to_string(),
            deadline,
            state: Mutex::new(TimerState::Pending(None)),
        });
        self.entries.lock().unwrap().insert(id, entry.clone());
        entry
    }

    fn remove(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    /// Remove and return all timers whose deadline has passed.
    fn take_due(&self, now: SystemTime) -> Vec<Arc<TimerEntry>> {
        let mut entries = self.entries.lock().unwrap();
        let due: Vec<u64> = entries
            .values()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.id)
            .collect();
        due.into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    fn next_deadline(&self) -> Option<SystemTime> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.deadline)
            .min()
    }

    fn snapshot(&self) -> Vec<PendingCall> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| PendingCall {
                id: entry.id,
                label: entry.label.clone(),
                deadline: entry.deadline,
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// A single-shot, cancellable timer on the deterministic scheduler.
///
/// Implementation of [`crate::Timer`].
pub struct Timer {
    entry: Arc<TimerEntry>,
    timers: Arc<Timers>,
    metrics: Arc<Metrics>,
}

impl Future for Timer {
    type Output = TimerOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let mut state = self.entry.state.lock().unwrap();
        match &mut *state {
            TimerState::Fired => Poll::Ready(TimerOutcome::Elapsed),
            TimerState::Cancelled => Poll::Ready(TimerOutcome::Cancelled),
            TimerState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl crate::Timer for Timer {
    type Canceller = Canceller;

    fn canceller(&self) -> Canceller {
        Canceller {
            entry: self.entry.clone(),
            timers: self.timers.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Abandoning the wait must not leave a dangling handle in the table.
        if self.entry.finish(TimerState::Cancelled).is_some() {
            self.timers.remove(self.entry.id);
            self.metrics.timers_cancelled.inc();
        }
    }
}

/// Implementation of [`crate::Canceller`] for the `deterministic` scheduler.
#[derive(Clone)]
pub struct Canceller {
    entry: Arc<TimerEntry>,
    timers: Arc<Timers>,
    metrics: Arc<Metrics>,
}

impl crate::Canceller for Canceller {
    fn cancel(&self) {
        let Some(waker) = self.entry.finish(TimerState::Cancelled) else {
            return;
        };
        self.timers.remove(self.entry.id);
        self.metrics.timers_cancelled.inc();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Task {
    id: u64,
    label: String,

    tasks: Arc<Tasks>,

    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,

    completed: Mutex<bool>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.tasks.enqueue(arc_self.clone());
    }
}

struct Tasks {
    counter: Mutex<u64>,
    queue: Mutex<Vec<Arc<Task>>>,
}

impl Tasks {
    fn register(
        arc_self: &Arc<Self>,
        label: &str,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) {
        let id = {
            let mut counter = arc_self.counter.lock().unwrap();
            let id = *counter;
            *counter = counter.checked_add(1).expect("task counter overflow");
            id
        };
        arc_self.queue.lock().unwrap().push(Arc::new(Task {
            id,
            label: label.to_string(),
            tasks: arc_self.clone(),
            future: Mutex::new(future),
            completed: Mutex::new(false),
        }));
    }

    fn enqueue(&self, task: Arc<Task>) {
        self.queue.lock().unwrap().push(task);
    }

    fn drain(&self) -> Vec<Arc<Task>> {
        let mut queue = self.queue.lock().unwrap();
        let len = queue.len();
        replace(&mut *queue, Vec::with_capacity(len))
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Configuration for the `deterministic` scheduler.
#[derive(Clone)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// The cycle duration determines how much time is advanced after each iteration of the event
    /// loop. This is useful to prevent starvation if some task never yields.
    pub cycle: Duration,

    /// If the scheduler is still executing at this point (i.e. a test hasn't stopped), panic.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            cycle: Duration::from_millis(1),
            timeout: None,
        }
    }
}

/// Deterministic scheduler that randomly selects tasks to run based on a seed.
pub struct Executor {
    registry: Mutex<Registry>,
    cycle: Duration,
    deadline: Option<SystemTime>,
    metrics: Arc<Metrics>,
    rng: Mutex<StdRng>,
    time: Mutex<SystemTime>,
    tasks: Arc<Tasks>,
    timers: Arc<Timers>,
}

impl Executor {
    /// Initialize a new `deterministic` scheduler with the given seed and cycle duration.
    pub fn init(cfg: Config) -> (Runner, Context) {
        // Ensure config is valid
        if cfg.timeout.is_some() && cfg.cycle == Duration::default() {
            panic!("cycle duration must be non-zero when timeout is set");
        }

        // Create a new registry
        let mut registry = Registry::default();
        let metrics_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);
        let metrics = Arc::new(Metrics::init(metrics_registry));

        let start_time = UNIX_EPOCH;
        let deadline = cfg
            .timeout
            .map(|timeout| start_time.checked_add(timeout).expect("timeout overflowed"));
        let executor = Arc::new(Self {
            registry: Mutex::new(registry),
            cycle: cfg.cycle,
            deadline,
            metrics,
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            time: Mutex::new(start_time),
            tasks: Arc::new(Tasks {
                queue: Mutex::new(Vec::new()),
                counter: Mutex::new(1), // Reserve 0 for the root task
            }),
            timers: Arc::new(Timers {
                counter: Mutex::new(0),
                entries: Mutex::new(BTreeMap::new()),
            }),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context { executor },
        )
    }

    /// Initialize a new `deterministic` scheduler with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> (Runner, Context) {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` scheduler with the default configuration
    /// but exit after the given timeout.
    pub fn timed(timeout: Duration) -> (Runner, Context) {
        let cfg = Config {
            timeout: Some(timeout),
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` scheduler with the default configuration.
    // We'd love to implement the trait but we can't because of the return type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Runner, Context) {
        Self::init(Config::default())
    }
}

/// A work item in the ready-queue: either a spawned task or the root future.
enum WorkItem {
    Root,
    Task(Arc<Task>),
}

/// Waker for the *root* future.
///
/// The root future isn't stored inside `Tasks`, so normal `ArcWake` machinery
/// doesn't apply. When it's woken we push a completed, dummy task into the
/// ready-queue; that guarantees the executor spins a new iteration and polls
/// the real root future right away.
struct RootWaker {
    tasks: Arc<Tasks>,
}

impl ArcWake for RootWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // Dummy task, already `completed`, so it's ignored as soon as it's seen.
        let dummy = Arc::new(Task {
            id: u64::MAX, // sentinel
            label: String::new(),
            tasks: arc_self.tasks.clone(),
            future: Mutex::new(Box::pin(async {})),
            completed: Mutex::new(true),
        });
        arc_self.tasks.enqueue(dummy);
    }
}

/// Drives execution of the `deterministic` scheduler.
pub struct Runner {
    executor: Arc<Executor>,
}

impl Runner {
    /// Run the root future to completion, returning its output.
    ///
    /// Panics with "runtime timeout" if a configured timeout elapses first and
    /// with "runtime stalled" if no task is runnable and no timer is pending
    /// (nothing could ever wake the root again).
    pub fn start<F>(self, f: F) -> F::Output
    where
        F: Future,
    {
        // Pin root task to the heap
        let mut root = Box::pin(f);

        // A waker for the root future
        let root_waker_src = Arc::new(RootWaker {
            tasks: self.executor.tasks.clone(),
        });

        // Process tasks until the root task completes
        let mut iter = 0;
        loop {
            // Ensure we have not exceeded our deadline
            if let Some(deadline) = self.executor.deadline {
                if *self.executor.time.lock().unwrap() >= deadline {
                    panic!("runtime timeout");
                }
            }

            // Snapshot available tasks and add the root
            let mut runnable: Vec<WorkItem> = self
                .executor
                .tasks
                .drain()
                .into_iter()
                .map(WorkItem::Task)
                .collect();
            runnable.push(WorkItem::Root);

            // Shuffle tasks
            {
                let mut rng = self.executor.rng.lock().unwrap();
                runnable.shuffle(&mut *rng);
            }

            // Run all snapshotted tasks
            //
            // This approach is more efficient than randomly selecting a task one-at-a-time
            // because it ensures we don't pull the same pending task multiple times in a row
            // (without processing a different task required for other tasks to make progress).
            trace!(iter, tasks = runnable.len(), "starting iteration");
            for item in runnable {
                match item {
                    WorkItem::Root => {
                        trace!(id = 0, "processing task");
                        let waker = waker_ref(&root_waker_src);
                        let mut cx = task::Context::from_waker(&waker);
                        self.executor
                            .metrics
                            .task_polls
                            .get_or_create(&Work {
                                label: String::new(),
                            })
                            .inc();
                        if let Poll::Ready(v) = root.as_mut().poll(&mut cx) {
                            trace!(id = 0, "task is complete");
                            return v;
                        }
                        trace!(id = 0, "task is still pending");
                    }
                    WorkItem::Task(task) => {
                        // If task is completed, skip it
                        if *task.completed.lock().unwrap() {
                            continue;
                        }

                        trace!(id = task.id, "processing task");
                        let waker = waker_ref(&task);
                        let mut cx = task::Context::from_waker(&waker);
                        self.executor
                            .metrics
                            .task_polls
                            .get_or_create(&Work {
                                label: task.label.clone(),
                            })
                            .inc();
                        let mut fut = task.future.lock().unwrap();
                        if fut.as_mut().poll(&mut cx).is_pending() {
                            trace!(id = task.id, "task is still pending");
                            continue;
                        }

                        // Mark task as completed and drop its future right away
                        // so any timers it still held are released (and leave
                        // the scheduled-work table) at completion, not at some
                        // later garbage-collection point.
                        *fut = Box::pin(async {});
                        drop(fut);
                        *task.completed.lock().unwrap() = true;
                        trace!(id = task.id, "task is complete");
                    }
                }
            }

            // Advance time by cycle
            //
            // This approach prevents starvation if some task never yields (to approximate this,
            // duration can be set to 1ns).
            let mut current;
            {
                let mut time = self.executor.time.lock().unwrap();
                *time = time
                    .checked_add(self.executor.cycle)
                    .expect("executor time overflowed");
                current = *time;
            }

            // Skip time if there is nothing to do
            if self.executor.tasks.len() == 0 {
                if let Some(next) = self.executor.timers.next_deadline() {
                    if next > current {
                        let mut time = self.executor.time.lock().unwrap();
                        *time = next;
                        current = next;
                        trace!(now = ?current, "time skipped");
                    }
                }
            }

            // Fire all timers that are due
            for entry in self.executor.timers.take_due(current) {
                if let Some(waker) = entry.finish(TimerState::Fired) {
                    trace!(id = entry.id, label = %entry.label, "timer fired");
                    self.executor.metrics.timers_fired.inc();
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
            }

            // If nothing is runnable and nothing is scheduled, no wake can
            // ever arrive: the root future would be polled forever without
            // progress.
            if self.executor.tasks.len() == 0 && self.executor.timers.is_empty() {
                panic!("runtime stalled");
            }
            iter += 1;
        }
    }
}

/// Implementation of [`crate::Scheduler`] for the `deterministic` runtime,
/// plus task spawning and seeded randomness.
#[derive(Clone)]
pub struct Context {
    executor: Arc<Executor>,
}

impl Context {
    /// Spawn a task that runs concurrently with the root future.
    pub fn spawn<F, T>(&self, label: &str, future: F) -> Handle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let work = Work {
            label: label.to_string(),
        };
        self.executor.metrics.tasks_spawned.get_or_create(&work).inc();
        let gauge = self
            .executor
            .metrics
            .tasks_running
            .get_or_create(&work)
            .clone();
        let (wrapped, handle) = Handle::init(future, gauge);
        Tasks::register(&self.executor.tasks, label, Box::pin(wrapped));
        handle
    }

    /// Encode all metrics into the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

impl crate::Scheduler for Context {
    type Timer = Timer;

    fn current(&self) -> SystemTime {
        *self.executor.time.lock().unwrap()
    }

    fn call_later(&self, label: &str, delay: Duration) -> Timer {
        let deadline = self
            .current()
            .checked_add(delay)
            .expect("overflow when setting wake time");
        let entry = self.executor.timers.register(label, deadline);
        self.executor
            .metrics
            .timers_scheduled
            .get_or_create(&Work {
                label: label.to_string(),
            })
            .inc();
        Timer {
            entry,
            timers: self.executor.timers.clone(),
            metrics: self.executor.metrics.clone(),
        }
    }

    fn delayed_calls(&self) -> Vec<PendingCall> {
        self.executor.timers.snapshot()
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.rng.lock().unwrap().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.rng.lock().unwrap().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.rng.lock().unwrap().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.rng.lock().unwrap().try_fill_bytes(dest)
    }
}
