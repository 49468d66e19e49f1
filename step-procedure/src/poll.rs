use crate::{CancelHandle, EngineEvent, Events, LogSink, OpResult, Pause};
use log::debug;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// How long a [`Poller`] keeps querying before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLimit {
    /// At most this many queries
    Attempts(u32),
    /// Stop once this much time has passed since the first query
    Deadline(Duration),
}

/// States that end a poll, successfully or not.
#[derive(Debug, Clone)]
pub struct Readiness<S> {
    ready: HashSet<S>,
    failed: HashSet<S>,
}

impl<S: Eq + Hash> Readiness<S> {
    pub fn new(ready: impl IntoIterator<Item = S>) -> Self {
        Self {
            ready: ready.into_iter().collect(),
            failed: HashSet::new(),
        }
    }

    /// States the resource cannot recover from on its own
    pub fn failing(mut self, failed: impl IntoIterator<Item = S>) -> Self {
        self.failed.extend(failed);
        self
    }

    pub fn is_ready(&self, state: &S) -> bool {
        self.ready.contains(state)
    }

    pub fn is_failed(&self, state: &S) -> bool {
        self.failed.contains(state)
    }
}

#[derive(Debug)]
pub enum PollError<S, E> {
    /// The resource reached a failure state
    FailureState { what: String, state: S },
    /// The budget ran out; `last` is the last state observed, if any
    TimedOut {
        what: String,
        attempts: u32,
        elapsed: Duration,
        last: Option<S>,
    },
    /// The query itself kept failing
    Query { what: String, error: E },
    Cancelled { what: String },
}

impl<S, E> PollError<S, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut { .. })
    }
}

impl<S: fmt::Debug, E: fmt::Display> fmt::Display for PollError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::FailureState { what, state } => {
                write!(f, "{} entered failure state {:?}", what, state)
            }
            PollError::TimedOut {
                what,
                attempts,
                elapsed,
                last,
            } => {
                write!(
                    f,
                    "timed out waiting for {} after {} attempts ({:?})",
                    what, attempts, elapsed
                )?;
                if let Some(s) = last {
                    write!(f, ", last state {:?}", s)?;
                }
                Ok(())
            }
            PollError::Query { what, error } => write!(f, "failed to query {}: {}", what, error),
            PollError::Cancelled { what } => write!(f, "cancelled while waiting for {}", what),
        }
    }
}

impl<S: fmt::Debug, E: fmt::Display + fmt::Debug> std::error::Error for PollError<S, E> {}

/// Waits for a resource to reach a ready state.
///
/// This is a coarser loop than [`crate::Executor`]: it watches the state of the
/// resource itself (is the VM running, is the group gone), not the completion of
/// the request that changed it.
#[derive(Clone)]
pub struct Poller {
    what: String,
    interval: Duration,
    limit: PollLimit,
    max_query_failures: u32,
    cancel: Option<CancelHandle>,
    pause: Pause,
    events: Events,
}

impl Poller {
    pub fn new(what: impl Into<String>, interval: Duration, limit: PollLimit) -> Self {
        Self {
            what: what.into(),
            interval,
            limit,
            max_query_failures: 3,
            cancel: None,
            pause: Pause::default(),
            events: LogSink::shared(),
        }
    }

    /// Consecutive failed queries tolerated before giving up
    pub fn with_max_query_failures(mut self, max: u32) -> Self {
        self.max_query_failures = max.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_pause(mut self, pause: Pause) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn what(&self) -> &str {
        &self.what
    }

    /// Query until the state is ready or failed, or the limit is reached.
    ///
    /// Any query error counts toward the consecutive failure budget; a successful
    /// query resets it.
    pub async fn poll_until_ready<S, E, F, Fut>(
        &self,
        readiness: &Readiness<S>,
        mut query: F,
    ) -> Result<S, PollError<S, E>>
    where
        S: Eq + Hash + fmt::Debug,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<S, E>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut last = None;

        loop {
            if self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
                return Err(PollError::Cancelled {
                    what: self.what.clone(),
                });
            }

            attempts += 1;
            match query().await {
                Ok(state) => {
                    failures = 0;
                    if readiness.is_failed(&state) {
                        return Err(PollError::FailureState {
                            what: self.what.clone(),
                            state,
                        });
                    }
                    if readiness.is_ready(&state) {
                        return Ok(state);
                    }
                    debug!("{} is {:?}, waiting", self.what, state);
                    last = Some(state);
                }
                Err(e) => {
                    failures += 1;
                    let error = e.into_inner();
                    self.events.emit(EngineEvent::PollQueryFailed {
                        what: self.what.clone(),
                        failures,
                        error: error.to_string(),
                    });
                    if failures >= self.max_query_failures {
                        return Err(PollError::Query {
                            what: self.what.clone(),
                            error,
                        });
                    }
                }
            }

            let elapsed = started.elapsed();
            let exhausted = match self.limit {
                PollLimit::Attempts(n) => attempts >= n,
                PollLimit::Deadline(d) => elapsed >= d,
            };
            if exhausted {
                self.events.emit(EngineEvent::PollTimedOut {
                    what: self.what.clone(),
                    attempts,
                    elapsed,
                });
                return Err(PollError::TimedOut {
                    what: self.what.clone(),
                    attempts,
                    elapsed,
                    last,
                });
            }

            self.pause.sleep(self.interval).await;
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("what", &self.what)
            .field("interval", &self.interval)
            .field("limit", &self.limit)
            .field("max_query_failures", &self.max_query_failures)
            .finish()
    }
}
