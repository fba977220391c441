//! Mock implementations of external collaborators.

use crate::{Error, KafkaClient, OffsetRequest, OffsetResponse};
use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex},
};

struct Inner {
    // Number of metadata loads after which a queried topic becomes known;
    // `None` means it never does.
    ready_after: Option<usize>,
    loads: usize,
    checks: usize,
    known: HashSet<String>,
    offsets: Vec<i64>,
    metadata_error: Option<String>,
    closed: bool,
}

/// A scriptable [`KafkaClient`].
///
/// Topics become "known" after a configurable number of metadata loads,
/// mirroring a broker that creates topics lazily and takes a few metadata
/// round trips to converge.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Mutex<Inner>>,
}

impl Client {
    fn new(ready_after: Option<usize>, metadata_error: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ready_after,
                loads: 0,
                checks: 0,
                known: HashSet::new(),
                offsets: Vec::new(),
                metadata_error,
                closed: false,
            })),
        }
    }

    /// A client whose queried topics become known on the `loads`-th metadata load.
    pub fn ready_after(loads: usize) -> Self {
        Self::new(Some(loads), None)
    }

    /// A client whose topics never become known.
    pub fn never_ready() -> Self {
        Self::new(None, None)
    }

    /// A client whose metadata loads fail with the given reason.
    pub fn failing_metadata(reason: &str) -> Self {
        Self::new(None, Some(reason.to_string()))
    }

    /// Fix the offsets returned for every offset request.
    pub fn with_offsets(self, offsets: Vec<i64>) -> Self {
        self.inner.lock().unwrap().offsets = offsets;
        self
    }

    /// Number of metadata loads performed so far.
    pub fn metadata_loads(&self) -> usize {
        self.inner.lock().unwrap().loads
    }

    /// Number of metadata lookups performed so far.
    pub fn metadata_checks(&self) -> usize {
        self.inner.lock().unwrap().checks
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl KafkaClient for Client {
    fn load_metadata_for_topics(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        let inner = self.inner.clone();
        let topic = topic.to_string();
        async move {
            let mut inner = inner.lock().unwrap();
            if inner.closed {
                return Err(Error::ClientClosed);
            }
            if let Some(reason) = &inner.metadata_error {
                return Err(Error::Metadata(reason.clone()));
            }
            inner.loads += 1;
            if inner.ready_after.is_some_and(|n| inner.loads >= n) {
                inner.known.insert(topic);
            }
            Ok(())
        }
    }

    fn has_metadata_for_topic(&self, topic: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.checks += 1;
        inner.known.contains(topic)
    }

    fn send_offset_request(
        &self,
        requests: &[OffsetRequest],
    ) -> impl Future<Output = Result<Vec<OffsetResponse>, Error>> + Send {
        let inner = self.inner.clone();
        let requests = requests.to_vec();
        async move {
            let inner = inner.lock().unwrap();
            if inner.closed {
                return Err(Error::ClientClosed);
            }
            Ok(requests
                .into_iter()
                .map(|request| OffsetResponse {
                    topic: request.topic,
                    partition: request.partition,
                    offsets: inner.offsets.clone(),
                })
                .collect())
        }
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send {
        let inner = self.inner.clone();
        async move {
            inner.lock().unwrap().closed = true;
            Ok(())
        }
    }
}
