use crate::{
    CancelHandle, EngineEvent, Events, LogSink, NetworkRetry, OpError, OpResult, Pause,
    RetryDecision, RetryPolicy,
};
use async_trait::async_trait;
use log::debug;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque token for a started remote operation, handed back to the
/// [`OperationTracker`] to poll its status.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a remote operation as reported by its status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus<E> {
    InProgress,
    Succeeded,
    Failed(E),
    /// The provider cancelled the operation
    Canceled,
}

/// Terminal result of waiting on one operation. Exactly one is produced per wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome<E> {
    Succeeded,
    Failed(E),
    /// Cancellation was requested locally while waiting
    Cancelled,
    /// The executor deadline passed while waiting
    TimedOut,
}

/// Why [`Executor`] gave up on an operation.
#[derive(Debug)]
pub enum OperationError<E> {
    /// Provider error that no rule retries, or whose rule budget is spent
    Provider(E),
    /// Transport failures outlasted the network retry budget
    Network(E),
    /// The provider reported the operation as canceled
    RemoteCanceled(OperationHandle),
    /// Cancellation was requested locally
    Cancelled,
    /// The executor deadline passed
    TimedOut(Duration),
}

impl<E> OperationError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }

    /// The provider or network error, if this is one
    pub fn source_error(&self) -> Option<&E> {
        match self {
            OperationError::Provider(e) | OperationError::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for OperationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Provider(e) => write!(f, "{}", e),
            OperationError::Network(e) => write!(f, "network error: {}", e),
            OperationError::RemoteCanceled(h) => write!(f, "operation {} was canceled", h),
            OperationError::Cancelled => write!(f, "operation cancelled"),
            OperationError::TimedOut(d) => write!(f, "operation timed out after {:?}", d),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for OperationError<E> {}

/// Reads the status endpoint of a started operation.
#[async_trait]
pub trait OperationTracker<E: Send>: Send + Sync {
    async fn operation_status(&self, handle: &OperationHandle) -> OpResult<OperationStatus<E>, E>;
}

/// Tracker for operations that never yield a handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTracker;

#[async_trait]
impl<E: Send + 'static> OperationTracker<E> for NoTracker {
    async fn operation_status(&self, _handle: &OperationHandle) -> OpResult<OperationStatus<E>, E> {
        Ok(OperationStatus::Succeeded)
    }
}

/// Drives remote operations to a terminal state.
///
/// Provider errors from starting an operation, or a failed terminal status, go
/// through the [`RetryPolicy`]; a retryable error restarts the whole operation
/// from `start` after the rule's delay. Transport failures are retried underneath
/// by [`NetworkRetry`].
///
/// # Example
/// ```ignore
/// let mut policy = default_retry_policy();
/// Executor::new()
///     .with_cancel(state.cancel_handle())
///     .execute_async_operation(client.as_ref(), &mut policy, || client.deallocate_vm(&rg, &vm))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Executor {
    poll_interval: Duration,
    network: NetworkRetry,
    cancel: Option<CancelHandle>,
    deadline: Option<Duration>,
    pause: Pause,
    events: Events,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            network: NetworkRetry::default(),
            cancel: None,
            deadline: None,
            pause: Pause::default(),
            events: LogSink::shared(),
        }
    }

    /// Interval between status queries of a started operation
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_network_retry(mut self, network: NetworkRetry) -> Self {
        self.network = network;
        self
    }

    /// Stop waiting once `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Give up after `deadline` across all attempts
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
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

    /// Start an operation and block until it is no longer in progress.
    ///
    /// `start` returning `Ok(None)` means the operation completed synchronously
    /// and is not polled.
    pub async fn execute_async_operation<T, F, Fut, E>(
        &self,
        tracker: &T,
        policy: &mut RetryPolicy<E>,
        mut start: F,
    ) -> Result<(), OperationError<E>>
    where
        T: OperationTracker<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<Option<OperationHandle>, E>>,
        E: fmt::Display + Send,
    {
        let started = Instant::now();

        loop {
            self.check_interrupted::<E>(started)?;

            let handle = match self.network.run(&self.pause, &mut start).await {
                Ok(Some(h)) => h,
                Ok(None) => return Ok(()),
                Err(OpError::Fatal(e)) => {
                    self.classify(policy, e).await?;
                    continue;
                }
                Err(OpError::Transient(e)) => return Err(OperationError::Network(e)),
            };

            self.events.emit(EngineEvent::OperationStarted {
                handle: handle.to_string(),
            });
            match self.wait_for_operation(tracker, &handle, started).await? {
                OperationOutcome::Succeeded => return Ok(()),
                OperationOutcome::Failed(e) => self.classify(policy, e).await?,
                OperationOutcome::Cancelled => return Err(OperationError::Cancelled),
                OperationOutcome::TimedOut => {
                    return Err(OperationError::TimedOut(self.deadline.unwrap_or_default()));
                }
            }
        }
    }

    /// Run a call that completes synchronously, applying the same classification.
    pub async fn execute_operation<F, Fut, R, E>(
        &self,
        policy: &mut RetryPolicy<E>,
        mut op: F,
    ) -> Result<R, OperationError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<R, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();

        loop {
            self.check_interrupted::<E>(started)?;
            match self.network.run(&self.pause, &mut op).await {
                Ok(r) => return Ok(r),
                Err(OpError::Fatal(e)) => self.classify(policy, e).await?,
                Err(OpError::Transient(e)) => return Err(OperationError::Network(e)),
            }
        }
    }

    /// Poll the status of `handle` until it leaves the in-progress state.
    pub async fn wait_for_operation<T, E>(
        &self,
        tracker: &T,
        handle: &OperationHandle,
        started: Instant,
    ) -> Result<OperationOutcome<E>, OperationError<E>>
    where
        T: OperationTracker<E> + ?Sized,
        E: fmt::Display + Send,
    {
        loop {
            if self.is_cancelled() {
                return Ok(OperationOutcome::Cancelled);
            }
            if self.is_past_deadline(started) {
                return Ok(OperationOutcome::TimedOut);
            }

            let status = self
                .network
                .run(&self.pause, || tracker.operation_status(handle))
                .await;
            match status {
                Ok(OperationStatus::InProgress) => {
                    debug!("Operation {} in progress", handle);
                    self.pause.sleep(self.poll_interval).await;
                }
                Ok(OperationStatus::Succeeded) => return Ok(OperationOutcome::Succeeded),
                Ok(OperationStatus::Failed(e)) | Err(OpError::Fatal(e)) => {
                    return Ok(OperationOutcome::Failed(e));
                }
                Ok(OperationStatus::Canceled) => {
                    return Err(OperationError::RemoteCanceled(handle.clone()));
                }
                Err(OpError::Transient(e)) => return Err(OperationError::Network(e)),
            }
        }
    }

    /// Consult the policy; sleeps and returns `Ok` when the error is retryable.
    async fn classify<E: fmt::Display>(
        &self,
        policy: &mut RetryPolicy<E>,
        error: E,
    ) -> Result<(), OperationError<E>> {
        match policy.decide(&error) {
            RetryDecision::Retry {
                rule,
                attempt,
                delay,
            } => {
                self.events.emit(EngineEvent::RetryScheduled {
                    rule,
                    attempt,
                    delay,
                    error: error.to_string(),
                });
                self.pause.sleep(delay).await;
                Ok(())
            }
            RetryDecision::Exhausted { rule, max_retries } => {
                self.events.emit(EngineEvent::RetriesExhausted {
                    rule,
                    max_retries,
                    error: error.to_string(),
                });
                Err(OperationError::Provider(error))
            }
            RetryDecision::Fatal => Err(OperationError::Provider(error)),
        }
    }

    fn check_interrupted<E>(&self, started: Instant) -> Result<(), OperationError<E>> {
        if self.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        if self.is_past_deadline(started) {
            return Err(OperationError::TimedOut(self.deadline.unwrap_or_default()));
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled)
    }

    fn is_past_deadline(&self, started: Instant) -> bool {
        self.deadline.is_some_and(|d| started.elapsed() >= d)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("poll_interval", &self.poll_interval)
            .field("network", &self.network)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RecordingSink, RetryRule};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct ProviderError(&'static str);

    impl fmt::Display for ProviderError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    /// Tracker replaying a scripted list of statuses
    struct ScriptedTracker {
        statuses: Mutex<VecDeque<OpResult<OperationStatus<ProviderError>, ProviderError>>>,
        queries: AtomicU32,
    }

    impl ScriptedTracker {
        fn new(
            statuses: impl IntoIterator<Item = OpResult<OperationStatus<ProviderError>, ProviderError>>,
        ) -> Self {
            Self {
                statuses: Mutex::new(statuses.into_iter().collect()),
                queries: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl OperationTracker<ProviderError> for ScriptedTracker {
        async fn operation_status(
            &self,
            _handle: &OperationHandle,
        ) -> OpResult<OperationStatus<ProviderError>, ProviderError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(OperationStatus::Succeeded))
        }
    }

    fn policy() -> RetryPolicy<ProviderError> {
        RetryPolicy::new()
            .with_rule(RetryRule::exponential(
                "Throttling",
                |e: &ProviderError| e.0 == "TooManyRequests",
                Duration::from_secs(5),
                Duration::from_secs(120),
                0,
            ))
            .with_rule(RetryRule::constant(
                "InternalError",
                |e: &ProviderError| e.0 == "InternalError",
                Duration::from_secs(10),
                2,
            ))
    }

    fn executor() -> (Executor, std::sync::Arc<Mutex<Vec<Duration>>>) {
        let (pause, sleeps) = Pause::recording();
        (
            Executor::new()
                .with_poll_interval(Duration::from_secs(1))
                .with_pause(pause),
            sleeps,
        )
    }

    #[tokio::test]
    async fn no_handle_is_immediate_success() {
        let (exec, sleeps) = executor();
        let tracker = ScriptedTracker::new([]);

        exec.execute_async_operation(&tracker, &mut policy(), || async { Ok(None) })
            .await
            .unwrap();

        assert_eq!(tracker.queries.load(Ordering::SeqCst), 0);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn polls_until_terminal() {
        let (exec, sleeps) = executor();
        let tracker = ScriptedTracker::new([
            Ok(OperationStatus::InProgress),
            Ok(OperationStatus::InProgress),
            Ok(OperationStatus::Succeeded),
        ]);

        exec.execute_async_operation(&tracker, &mut policy(), || async {
            Ok(Some(OperationHandle::new("op-1")))
        })
        .await
        .unwrap();

        assert_eq!(tracker.queries.load(Ordering::SeqCst), 3);
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(1); 2]);
    }

    #[tokio::test]
    async fn retryable_start_error_restarts_operation() {
        let (exec, sleeps) = executor();
        let tracker = ScriptedTracker::new([]);
        let starts = AtomicU32::new(0);

        exec.execute_async_operation(&tracker, &mut policy(), || {
            let n = starts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OpError::Fatal(ProviderError("TooManyRequests")))
                } else {
                    Ok(Some(OperationHandle::new("op-1")))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn retryable_terminal_failure_restarts_from_start() {
        let (exec, _) = executor();
        let tracker = ScriptedTracker::new([
            Ok(OperationStatus::Failed(ProviderError("InternalError"))),
            Ok(OperationStatus::InProgress),
            Ok(OperationStatus::Succeeded),
        ]);
        let starts = AtomicU32::new(0);

        exec.execute_async_operation(&tracker, &mut policy(), || {
            starts.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(OperationHandle::new("op-1"))) }
        })
        .await
        .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unmatched_failure_is_fatal() {
        let (exec, _) = executor();
        let tracker = ScriptedTracker::new([Ok(OperationStatus::Failed(ProviderError(
            "InvalidTemplate",
        )))]);
        let starts = AtomicU32::new(0);

        let err = exec
            .execute_async_operation(&tracker, &mut policy(), || {
                starts.fetch_add(1, Ordering::SeqCst);
                async { Ok(Some(OperationHandle::new("op-1"))) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Provider(ProviderError("InvalidTemplate"))));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_rule_surfaces_error() {
        let sink = RecordingSink::new();
        let (exec, _) = executor();
        let exec = exec.with_events(sink.clone());
        let tracker = ScriptedTracker::new([]);
        let starts = AtomicU32::new(0);

        let err = exec
            .execute_async_operation(&tracker, &mut policy(), || {
                starts.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<OperationHandle>, _>(OpError::Fatal(ProviderError("InternalError"))) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Provider(_)));
        // 1 initial + 2 retries
        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert!(sink.events().contains(&EngineEvent::RetriesExhausted {
            rule: "InternalError".to_string(),
            max_retries: 2,
            error: "InternalError".to_string(),
        }));
    }

    #[tokio::test]
    async fn network_errors_are_retried_below_policy() {
        let (exec, sleeps) = executor();
        let tracker = ScriptedTracker::new([
            Err(OpError::Transient(ProviderError("connection reset by peer"))),
            Ok(OperationStatus::Succeeded),
        ]);
        let mut policy = policy();

        exec.execute_async_operation(&tracker, &mut policy, || async {
            Ok(Some(OperationHandle::new("op-1")))
        })
        .await
        .unwrap();

        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_millis(500)]);
        assert!(policy.rules().iter().all(|r| r.consultations() == 0));
    }

    #[tokio::test]
    async fn remote_cancel_is_reported() {
        let (exec, _) = executor();
        let tracker = ScriptedTracker::new([Ok(OperationStatus::Canceled)]);

        let err = exec
            .execute_async_operation(&tracker, &mut policy(), || async {
                Ok(Some(OperationHandle::new("op-9")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::RemoteCanceled(h) if h.as_str() == "op-9"));
    }

    #[tokio::test]
    async fn local_cancel_stops_waiting() {
        let cancel = CancelHandle::new();
        let c = cancel.clone();
        let (pause, _) = Pause::recording();
        let exec = Executor::new()
            .with_cancel(cancel.clone())
            .with_pause(Pause::from_fn(move |d| {
                // cancel during the first poll sleep
                c.cancel();
                let pause = pause.clone();
                async move { pause.sleep(d).await }
            }));
        let tracker = ScriptedTracker::new([
            Ok(OperationStatus::InProgress),
            Ok(OperationStatus::InProgress),
        ]);

        let err = exec
            .execute_async_operation(&tracker, &mut policy(), || async {
                Ok(Some(OperationHandle::new("op-1")))
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(tracker.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out() {
        let exec = Executor::new()
            .with_poll_interval(Duration::from_secs(30))
            .with_deadline(Duration::from_secs(60));
        let tracker = ScriptedTracker::new(
            std::iter::repeat_with(|| Ok(OperationStatus::InProgress)).take(10),
        );

        let err = exec
            .execute_async_operation(&tracker, &mut policy(), || async {
                Ok(Some(OperationHandle::new("op-1")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::TimedOut(d) if d == Duration::from_secs(60)));
        assert_eq!(tracker.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_operation_returns_value() {
        let (exec, sleeps) = executor();
        let calls = AtomicU32::new(0);

        let v = exec
            .execute_operation(&mut policy(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(OpError::Fatal(ProviderError("TooManyRequests")))
                    } else {
                        Ok("10.1.2.3")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(v, "10.1.2.3");
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(5)]);
    }
}
