use crate::{BoxFuture, EngineEvent, Events, LogSink, StateBag};
use async_trait::async_trait;
use log::warn;
use std::error::Error;
use std::fmt;

/// What a step tells the runner after its forward action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Stop and unwind. The step records its error in the [`StateBag`] first.
    Halt,
}

pub type CleanupResult = Result<(), Box<dyn Error + Send + Sync>>;

/// One provisioning action with a compensating cleanup.
///
/// `cleanup` is only called on steps whose `run` was entered, and must be safe
/// to call more than once: check what `run` actually created before undoing it.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&mut self, state: &StateBag) -> StepAction;

    async fn cleanup(&mut self, _state: &StateBag) -> CleanupResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Running(usize),
    Continuing(usize),
    Halted(usize),
    Cancelled(usize),
    Completed,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Step `index` halted; `error` is the first error recorded in the bag
    Halted {
        index: usize,
        step: String,
        error: Option<String>,
    },
    /// Cancellation was observed right after step `index` ran, or before it
    /// started.
    ///
    /// In the second case `step` names a step whose `run` was never entered and
    /// which is not cleaned up; [`RunReport::unwound`] lists what was.
    Cancelled { index: usize, step: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub final_state: RunnerState,
    /// Names of the steps cleaned up, in the order cleanup ran
    pub unwound: Vec<String>,
    /// Cleanup failures, reported but never fatal
    pub cleanup_warnings: Vec<String>,
}

/// Awaited before each step with its index and name.
pub type PauseHook = Box<dyn Fn(usize, &str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs [`Step`]s in order against one [`StateBag`].
///
/// On halt or cancellation every step whose `run` was entered is cleaned up,
/// most recent first. A failing cleanup is reported and the unwind continues.
pub struct StepRunner {
    steps: Vec<Box<dyn Step>>,
    pause_hook: Option<PauseHook>,
    events: Events,
    state: RunnerState,
}

impl StepRunner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            pause_hook: None,
            events: LogSink::shared(),
            state: RunnerState::NotStarted,
        }
    }

    /// Single-step mode: `hook` is awaited before every step
    pub fn with_pause_hook(mut self, hook: PauseHook) -> Self {
        self.pause_hook = Some(hook);
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(mut self, bag: &StateBag) -> RunReport {
        let mut entered = 0usize;
        let mut outcome = RunOutcome::Completed;

        for index in 0..self.steps.len() {
            let name = self.steps[index].name().to_string();

            if let Some(hook) = &self.pause_hook {
                self.events.emit(EngineEvent::Paused {
                    index,
                    name: name.clone(),
                });
                hook(index, &name).await;
            }

            if bag.is_cancelled() {
                outcome = self.cancelled(index, name);
                break;
            }

            self.state = RunnerState::Running(index);
            self.events.emit(EngineEvent::StepStarted {
                index,
                name: name.clone(),
            });
            entered = index + 1;
            let action = self.steps[index].run(bag).await;

            if bag.is_cancelled() {
                outcome = self.cancelled(index, name);
                break;
            }

            match action {
                StepAction::Continue => {
                    self.state = RunnerState::Continuing(index + 1);
                    self.events.emit(EngineEvent::StepCompleted { index, name });
                }
                StepAction::Halt => {
                    let error = bag.error().map(str::to_string);
                    self.state = RunnerState::Halted(index);
                    self.events.emit(EngineEvent::StepHalted {
                        index,
                        name: name.clone(),
                        error: error.clone(),
                    });
                    outcome = RunOutcome::Halted {
                        index,
                        step: name,
                        error,
                    };
                    break;
                }
            }
        }

        if outcome.is_completed() {
            self.state = RunnerState::Completed;
            return RunReport {
                outcome,
                final_state: self.state,
                unwound: vec![],
                cleanup_warnings: vec![],
            };
        }

        let (unwound, cleanup_warnings) = self.unwind(bag, entered).await;
        RunReport {
            outcome,
            final_state: self.state,
            unwound,
            cleanup_warnings,
        }
    }

    fn cancelled(&mut self, index: usize, name: String) -> RunOutcome {
        self.state = RunnerState::Cancelled(index);
        self.events.emit(EngineEvent::StepCancelled {
            index,
            name: name.clone(),
        });
        RunOutcome::Cancelled { index, step: name }
    }

    /// Clean up steps `entered - 1` down to `0`
    async fn unwind(&mut self, bag: &StateBag, entered: usize) -> (Vec<String>, Vec<String>) {
        let mut unwound = Vec::with_capacity(entered);
        let mut warnings = Vec::new();

        for index in (0..entered).rev() {
            let step = &mut self.steps[index];
            let name = step.name().to_string();
            self.events.emit(EngineEvent::CleanupStarted {
                index,
                name: name.clone(),
            });
            if let Err(e) = step.cleanup(bag).await {
                warn!("Cleanup of {} failed: {}", name, e);
                self.events.emit(EngineEvent::CleanupFailed {
                    index,
                    name: name.clone(),
                    error: e.to_string(),
                });
                warnings.push(format!("{}: {}", name, e));
            }
            unwound.push(name);
        }

        (unwound, warnings)
    }
}

impl fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRunner")
            .field("steps", &self.step_names())
            .field("state", &self.state)
            .field("pause_hook", &self.pause_hook.is_some())
            .finish()
    }
}
