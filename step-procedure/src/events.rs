use log::{debug, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Progress reported by the engine to whatever renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StepStarted {
        index: usize,
        name: String,
    },
    StepCompleted {
        index: usize,
        name: String,
    },
    StepHalted {
        index: usize,
        name: String,
        error: Option<String>,
    },
    StepCancelled {
        index: usize,
        name: String,
    },
    /// The runner is waiting on its pause hook before step `index`
    Paused {
        index: usize,
        name: String,
    },
    CleanupStarted {
        index: usize,
        name: String,
    },
    CleanupFailed {
        index: usize,
        name: String,
        error: String,
    },
    OperationStarted {
        handle: String,
    },
    RetryScheduled {
        rule: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RetriesExhausted {
        rule: String,
        max_retries: u32,
        error: String,
    },
    PollQueryFailed {
        what: String,
        failures: u32,
        error: String,
    },
    PollTimedOut {
        what: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::StepStarted { index, name } => write!(f, "[{}] {}: started", index, name),
            EngineEvent::StepCompleted { index, name } => {
                write!(f, "[{}] {}: completed", index, name)
            }
            EngineEvent::StepHalted { index, name, error } => match error {
                Some(e) => write!(f, "[{}] {}: halted: {}", index, name, e),
                None => write!(f, "[{}] {}: halted", index, name),
            },
            EngineEvent::StepCancelled { index, name } => {
                write!(f, "[{}] {}: cancelled", index, name)
            }
            EngineEvent::Paused { index, name } => write!(f, "[{}] {}: paused", index, name),
            EngineEvent::CleanupStarted { index, name } => {
                write!(f, "[{}] {}: cleaning up", index, name)
            }
            EngineEvent::CleanupFailed { index, name, error } => {
                write!(f, "[{}] {}: cleanup failed: {}", index, name, error)
            }
            EngineEvent::OperationStarted { handle } => {
                write!(f, "Waiting for operation: {}", handle)
            }
            EngineEvent::RetryScheduled {
                rule,
                attempt,
                delay,
                error,
            } => write!(
                f,
                "Retry {} for rule '{}' in {:?}: {}",
                attempt, rule, delay, error
            ),
            EngineEvent::RetriesExhausted {
                rule,
                max_retries,
                error,
            } => write!(
                f,
                "Retries for rule '{}' exhausted ({}): {}",
                rule, max_retries, error
            ),
            EngineEvent::PollQueryFailed {
                what,
                failures,
                error,
            } => write!(
                f,
                "Querying {} failed ({} in a row): {}",
                what, failures, error
            ),
            EngineEvent::PollTimedOut {
                what,
                attempts,
                elapsed,
            } => write!(
                f,
                "Gave up waiting for {} after {} attempts ({:?})",
                what, attempts, elapsed
            ),
        }
    }
}

/// Receives [`EngineEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

pub type Events = Arc<dyn EventSink>;

/// Renders events through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
    pub fn shared() -> Events {
        Arc::new(LogSink)
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::StepHalted { .. }
            | EngineEvent::CleanupFailed { .. }
            | EngineEvent::RetriesExhausted { .. }
            | EngineEvent::PollQueryFailed { .. }
            | EngineEvent::PollTimedOut { .. }
            | EngineEvent::RetryScheduled { .. } => warn!("{}", event),
            EngineEvent::OperationStarted { .. } | EngineEvent::Paused { .. } => {
                debug!("{}", event)
            }
            _ => info!("{}", event),
        }
    }
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingSink(Mutex<Vec<EngineEvent>>);

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
