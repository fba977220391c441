//! Utility functions for interacting with any scheduler.

use crate::Error;
use futures::{
    channel::oneshot,
    stream::{AbortHandle, Abortable},
    FutureExt,
};
use prometheus_client::metrics::gauge::Gauge;
use rand::{
    distributions::{Alphanumeric, DistString},
    Rng,
};
use std::{
    any::Any,
    future::Future,
    panic::{resume_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Once},
    task::{Context, Poll},
};
use tracing::error;

/// Yield control back to the scheduler.
pub async fn reschedule() {
    struct Reschedule {
        yielded: bool,
    }

    impl Future for Reschedule {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    Reschedule { yielded: false }.await
}

fn extract_panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", err)
    }
}

/// Handle to a spawned task.
pub struct Handle<T>
where
    T: Send + 'static,
{
    aborter: AbortHandle,
    receiver: oneshot::Receiver<T>,

    running: Gauge,
    once: Arc<Once>,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    pub(crate) fn init<F>(f: F, running: Gauge) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        // Increment running counter
        running.inc();

        // Initialize channels to handle result/abort
        let once = Arc::new(Once::new());
        let (sender, receiver) = oneshot::channel();
        let (aborter, abort_registration) = AbortHandle::new_pair();

        // Wrap the future to decrement the running gauge on all exits and to
        // surface panics in the executor (which tears the test down).
        let wrapped = {
            let once = once.clone();
            let running = running.clone();
            async move {
                let result = AssertUnwindSafe(f).catch_unwind().await;
                once.call_once(|| {
                    running.dec();
                });
                match result {
                    Ok(value) => {
                        let _ = sender.send(value);
                    }
                    Err(err) => {
                        let msg = extract_panic_message(&*err);
                        error!(err = ?msg, "task panicked");
                        resume_unwind(err);
                    }
                }
            }
        };

        // Make the future abortable
        let abortable = Abortable::new(wrapped, abort_registration);
        (
            abortable.map(|_| ()),
            Self {
                aborter,
                receiver,

                running,
                once,
            },
        )
    }

    /// Abort the task (if not yet complete).
    pub fn abort(&self) {
        // Stop task
        self.aborter.abort();

        // Decrement running counter
        self.once.call_once(|| {
            self.running.dec();
        });
    }
}

impl<T> Future for Handle<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Closed))
    }
}

/// Generate a random alphanumeric string of the requested length.
pub fn random_string<R: Rng>(rng: &mut R, len: usize) -> String {
    Alphanumeric.sample_string(rng, len)
}

/// Find a free TCP port by binding port 0 and reading back the assignment.
///
/// Collaborator for parameterizing client construction; the port is released
/// before this returns, so a race with other processes is possible.
pub fn get_open_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
pub(crate) fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deterministic::Executor, Scheduler};
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    #[test]
    fn test_random_string_length_and_charset() {
        let mut rng = StdRng::seed_from_u64(0);
        for len in [0, 1, 10, 50, 173] {
            let s = random_string(&mut rng, len);
            assert_eq!(s.len(), len);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_random_string_seeded_is_reproducible() {
        let a = random_string(&mut StdRng::seed_from_u64(7), 16);
        let b = random_string(&mut StdRng::seed_from_u64(7), 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_get_open_port() {
        let port = get_open_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_abort_resolves_closed() {
        init_logging();
        let (runner, context) = Executor::default();
        runner.start({
            let context = context.clone();
            async move {
                let handle = context.spawn("sleeper", {
                    let context = context.clone();
                    async move {
                        let _ = context.call_later("nap", Duration::from_secs(60)).await;
                    }
                });

                // Let the sleeper start waiting, then abort it.
                reschedule().await;
                handle.abort();
                assert!(matches!(handle.await, Err(Error::Closed)));

                // The aborted task's timer was released with it.
                assert!(context.delayed_calls().is_empty());
            }
        });
    }
}
