use std::future::Future;
use std::time::Duration;

/// How often [`InterruptibleTask`] checks the cancellation flag.
pub const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T, E> {
    Completed(Result<T, E>),
    /// Cancellation was observed first; the task was left running
    Cancelled,
}

impl<T, E> TaskOutcome<T, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// Races a unit of work against a cancellation flag.
///
/// For remote calls with no cancellation of their own: the work runs on its own
/// tokio task and is abandoned, not aborted, once cancellation wins.
pub struct InterruptibleTask<C> {
    is_cancelled: C,
    poll_interval: Duration,
}

impl<C> InterruptibleTask<C>
where
    C: Fn() -> bool,
{
    pub fn new(is_cancelled: C) -> Self {
        Self {
            is_cancelled,
            poll_interval: CANCELLATION_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run<F, T, E>(&self, task: F) -> TaskOutcome<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut handle = tokio::spawn(task);

        loop {
            if (self.is_cancelled)() {
                // dropping the JoinHandle detaches the task
                return TaskOutcome::Cancelled;
            }

            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(r) => TaskOutcome::Completed(r),
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => TaskOutcome::Cancelled,
                    };
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Shorthand for `InterruptibleTask::new(is_cancelled).run(task)`
pub async fn run_interruptible<C, F, T, E>(is_cancelled: C, task: F) -> TaskOutcome<T, E>
where
    C: Fn() -> bool,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    InterruptibleTask::new(is_cancelled).run(task).await
}
