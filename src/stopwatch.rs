//! Scoped elapsed-time measurement.

use crate::Scheduler;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Reader for the interval recorded by a dropped [`Stopwatch`].
#[derive(Clone)]
pub struct Reading {
    slot: Arc<Mutex<Option<Duration>>>,
}

impl Reading {
    /// The recorded interval, or `None` while the stopwatch is still running.
    pub fn interval(&self) -> Option<Duration> {
        *self.slot.lock().unwrap()
    }
}

/// Measures the time a scope was alive.
///
/// Captures the scheduler's time on construction and records the interval
/// into its [`Reading`] when dropped, on every exit path (normal return,
/// early `?` return, or unwind). Purely observational.
pub struct Stopwatch<S: Scheduler> {
    scheduler: S,
    start: SystemTime,
    slot: Arc<Mutex<Option<Duration>>>,
}

impl<S: Scheduler> Stopwatch<S> {
    /// Start measuring now.
    pub fn start(scheduler: &S) -> (Self, Reading) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self {
                scheduler: scheduler.clone(),
                start: scheduler.current(),
                slot: slot.clone(),
            },
            Reading { slot },
        )
    }

    /// Time elapsed since the stopwatch started.
    pub fn elapsed(&self) -> Duration {
        self.scheduler
            .current()
            .duration_since(self.start)
            .unwrap_or_default()
    }
}

impl<S: Scheduler> Drop for Stopwatch<S> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap() = Some(self.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deterministic::{Context, Executor},
        Error,
    };

    #[test]
    fn test_records_interval_on_drop() {
        let (runner, context) = Executor::default();
        runner.start(async move {
            let (watch, reading) = Stopwatch::start(&context);
            assert_eq!(reading.interval(), None);

            let _ = context
                .call_later("nap", Duration::from_millis(50))
                .await;
            assert!(watch.elapsed() >= Duration::from_millis(50));

            drop(watch);
            let interval = reading.interval().unwrap();
            assert!(interval >= Duration::from_millis(50));
        });
    }

    #[test]
    fn test_records_on_early_exit() {
        async fn measured(context: &Context, reading_out: &mut Option<Reading>) -> Result<(), Error> {
            let (_watch, reading) = Stopwatch::start(context);
            *reading_out = Some(reading);
            let _ = context.call_later("nap", Duration::from_millis(5)).await;
            Err(Error::Closed)?;
            unreachable!()
        }

        let (runner, context) = Executor::default();
        runner.start(async move {
            let mut reading = None;
            let err = measured(&context, &mut reading).await.unwrap_err();
            assert!(matches!(err, Error::Closed));
            // The guard recorded despite the error exit.
            let interval = reading.unwrap().interval().unwrap();
            assert!(interval >= Duration::from_millis(5));
        });
    }
}
