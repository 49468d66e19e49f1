//! Ordered provisioning steps with unwind, rule-based retry and operation polling.
//!
//! This crate is the execution engine behind an image build. It provides:
//!
//! - [`StateBag`]: the typed, thread-safe blackboard shared by every step of a run,
//!   carrying the cancellation flag and the first recorded error.
//!
//! - [`StepRunner`]: runs a list of [`Step`]s in order. When a step halts, or the
//!   run is cancelled, every step whose `run` was entered is cleaned up in reverse.
//!
//! - [`RetryPolicy`] / [`RetryRule`]: first-match-wins classification of provider
//!   errors into "retry after a delay" or "give up", with per-rule budgets.
//!
//! - [`Executor`]: drives a long-running remote operation (start, then poll its
//!   status endpoint) and restarts it when the policy says the failure is transient.
//!
//! - [`Poller`]: waits for a *resource* to reach a ready state, short-circuiting on
//!   failure states and giving up after an attempt or wall-clock budget.
//!
//! - [`InterruptibleTask`]: races a unit of work against the cancellation flag for
//!   calls with no cancellation primitive of their own.
//!
//! # Error Classification
//!
//! Remote adapters return [`OpResult<T, E>`]. A [`OpError::Transient`] is a
//! network-level blip (connection reset, DNS hiccup) retried at a short fixed
//! interval by [`NetworkRetry`]. A [`OpError::Fatal`] carries a provider-reported
//! error, which the [`RetryPolicy`] then classifies:
//!
//! ```ignore
//! use step_procedure::{OpError, OpResult};
//!
//! async fn start_capture() -> OpResult<Option<OperationHandle>, ArmError> {
//!     match client.capture().await {
//!         Ok(h) => Ok(h),
//!         Err(e) if e.is_connect() => Err(OpError::Transient(e.into())),
//!         Err(e) => Err(OpError::Fatal(e.into())),
//!     }
//! }
//! ```
//!
//! # Steps
//!
//! ```ignore
//! use step_procedure::{StateBag, StepRunner};
//!
//! let state = StateBag::new();
//! let report = StepRunner::new(vec![
//!     Box::new(CreateResourceGroup::new(client.clone())),
//!     Box::new(DeployTemplate::new(client.clone())),
//! ])
//! .run(&state)
//! .await;
//! ```

use log::warn;
use std::fmt;
use std::future::Future;
use std::time::Duration;

mod context;
mod events;
mod interrupt;
mod operation;
mod pause;
mod poll;
mod retry;
mod runner;


pub use context::{CancelHandle, Key, MissingKey, StateBag};
pub use events::{EngineEvent, EventSink, Events, LogSink, RecordingSink};
pub use interrupt::{CANCELLATION_POLL_INTERVAL, InterruptibleTask, TaskOutcome, run_interruptible};
pub use operation::{
    Executor, NoTracker, OperationError, OperationHandle, OperationOutcome, OperationStatus,
    OperationTracker,
};
pub use pause::{BoxFuture, Pause};
pub use poll::{PollError, PollLimit, Poller, Readiness};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryRule};
pub use runner::{
    CleanupResult, PauseHook, RunOutcome, RunReport, RunnerState, Step, StepAction, StepRunner,
};

// ─── Error Classification ──────────────────────────────────────────────────────

/// An error returned by a remote adapter, split by who should deal with it.
#[derive(Debug)]
pub enum OpError<E> {
    /// Transport-level failure that is retried at a short fixed interval
    Transient(E),
    /// Provider-reported failure, handed to the [`RetryPolicy`] for classification
    Fatal(E),
}

impl<E> OpError<E> {
    /// Extract the inner error regardless of variant
    pub fn into_inner(self) -> E {
        match self {
            OpError::Transient(e) | OpError::Fatal(e) => e,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OpError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, OpError::Fatal(_))
    }

    pub fn inner(&self) -> &E {
        match self {
            OpError::Transient(e) | OpError::Fatal(e) => e,
        }
    }

    /// Map the inner error, keeping the classification
    pub fn map<F, U>(self, f: F) -> OpError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            OpError::Transient(e) => OpError::Transient(f(e)),
            OpError::Fatal(e) => OpError::Fatal(f(e)),
        }
    }
}

impl<E: fmt::Display> fmt::Display for OpError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Transient(e) => write!(f, "transient error: {}", e),
            OpError::Fatal(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for OpError<E> {}

/// Result type returned by remote adapters.
pub type OpResult<T, E = Box<dyn std::error::Error + Send + Sync>> = Result<T, OpError<E>>;

// ─── Network-level retry ───────────────────────────────────────────────────────

/// Fixed-interval retry for transport failures.
///
/// This loop sits underneath the provider [`RetryPolicy`]: it only ever sees
/// [`OpError::Transient`] and passes [`OpError::Fatal`] straight through.
#[derive(Debug, Clone)]
pub struct NetworkRetry {
    /// Delay between attempts
    pub delay: Duration,
    /// Maximum number of retries (not counting the first attempt)
    pub max_retries: u32,
}

impl Default for NetworkRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_retries: 10,
        }
    }
}

impl NetworkRetry {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Run `f` until it returns something other than [`OpError::Transient`].
    ///
    /// When the budget runs out the last transient error is returned as-is so the
    /// caller can tell "network gave up" apart from a provider error.
    pub async fn run<F, Fut, T, E>(&self, pause: &Pause, mut f: F) -> OpResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            match f().await {
                Err(OpError::Transient(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Network error (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_retries, self.delay, e
                    );
                    pause.sleep(self.delay).await;
                }
                r => return r,
            }
        }
    }
}

/// Retry `f` on transport failures only, without any provider classification.
///
/// Useful for plain reads inside a step where a provider error should surface
/// immediately.
///
/// # Example
/// ```ignore
/// let ip = retry_async(&NetworkRetry::default(), || client.public_ip_address(&rg, &name)).await?;
/// ```
pub async fn retry_async<F, Fut, T, E>(policy: &NetworkRetry, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OpResult<T, E>>,
    E: fmt::Display,
{
    policy
        .run(&Pause::default(), f)
        .await
        .map_err(OpError::into_inner)
}
