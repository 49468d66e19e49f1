use crate::arm::{ArmClient, ArmError};
use crate::retry::retry_policy;
use crate::settings::{PollingConfig, RetrySettings, Settings};
use log::{error, info};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use step_procedure::{
    Events, Executor, LogSink, Pause, PollLimit, Poller, RetryPolicy, StateBag, StepAction,
};

mod communicator;
mod deployment;
mod image;
mod resource_group;
mod vm;


pub use communicator::{GeneralizeOs, PortState, RunProvisioningHook, WaitForSsh};
pub use deployment::{DeployTemplate, GetIpAddress, ValidateTemplate};
pub use image::CaptureImage;
pub use resource_group::{CreateResourceGroup, DeleteResourceGroup, delete_resource_group};
pub use vm::{GeneralizeVm, PowerOffVm, WaitForVmReady};

/// What every ARM step needs: the client and how to retry and poll.
pub struct StepEnv {
    pub client: Arc<dyn ArmClient>,
    pub retry: RetrySettings,
    pub polling: PollingConfig,
    pub pause: Pause,
    pub events: Events,
}

impl StepEnv {
    pub fn new(client: Arc<dyn ArmClient>, settings: &Settings) -> Self {
        Self {
            client,
            retry: settings.retry.clone(),
            polling: settings.polling.clone(),
            pause: Pause::default(),
            events: LogSink::shared(),
        }
    }

    pub fn with_pause(mut self, pause: Pause) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    /// A fresh policy, every operation starts with full rule budgets
    pub fn policy(&self) -> RetryPolicy<ArmError> {
        retry_policy(&self.retry)
    }

    /// Executor that ignores cancellation, for cleanup
    pub fn executor(&self) -> Executor {
        Executor::new()
            .with_poll_interval(self.polling.operation_interval)
            .with_pause(self.pause.clone())
            .with_events(self.events.clone())
    }

    /// Executor that stops once the build is cancelled
    pub fn cancellable_executor(&self, state: &StateBag) -> Executor {
        self.executor().with_cancel(state.cancel_handle())
    }

    pub fn poller(&self, what: impl Into<String>, interval: Duration, limit: PollLimit) -> Poller {
        Poller::new(what, interval, limit)
            .with_pause(self.pause.clone())
            .with_events(self.events.clone())
    }

    pub fn cancellable_poller(
        &self,
        state: &StateBag,
        what: impl Into<String>,
        interval: Duration,
        limit: PollLimit,
    ) -> Poller {
        self.poller(what, interval, limit)
            .with_cancel(state.cancel_handle())
    }
}

/// Record `error` as the build error and halt.
///
/// Once the build is cancelled the failure is only logged: the run ends as
/// cancelled and the bag keeps no error.
pub(crate) fn halt(state: &StateBag, step: &str, error: impl Display) -> StepAction {
    if state.is_cancelled() {
        info!("{} interrupted: {}", step, error);
    } else {
        error!("{} failed: {}", step, error);
        state.record_error(&error);
    }
    StepAction::Halt
}
