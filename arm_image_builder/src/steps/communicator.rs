use crate::ssh_client::Communicator;
use crate::state::SSH_HOST;
use crate::steps::{StepEnv, halt};
use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use step_procedure::{OpResult, PollLimit, Readiness, StateBag, Step, StepAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Open,
    Closed,
}

async fn port_state(communicator: &dyn Communicator, host: &str) -> OpResult<PortState> {
    if communicator.is_reachable(host).await {
        Ok(PortState::Open)
    } else {
        Ok(PortState::Closed)
    }
}

/// Waits until the build VM accepts connections from the communicator.
pub struct WaitForSsh {
    env: Arc<StepEnv>,
    communicator: Arc<dyn Communicator>,
    timeout: Duration,
}

impl WaitForSsh {
    pub fn new(env: Arc<StepEnv>, communicator: Arc<dyn Communicator>, timeout: Duration) -> Self {
        Self {
            env,
            communicator,
            timeout,
        }
    }
}

#[async_trait]
impl Step for WaitForSsh {
    fn name(&self) -> &str {
        "wait-for-ssh"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let host = state.get(SSH_HOST);
        info!("Waiting for SSH on {}", host);

        let communicator = self.communicator.as_ref();
        let res = self
            .env
            .cancellable_poller(
                state,
                format!("ssh on {}", host),
                self.env.polling.ssh_interval,
                PollLimit::Deadline(self.timeout),
            )
            .poll_until_ready(&Readiness::new([PortState::Open]), || {
                port_state(communicator, &host)
            })
            .await;
        match res {
            Ok(_) => StepAction::Continue,
            Err(e) => halt(state, self.name(), e),
        }
    }
}

async fn run_command(
    communicator: &dyn Communicator,
    state: &StateBag,
    command: &str,
) -> Result<()> {
    let host = state.get(SSH_HOST);
    let (status, output) = communicator.execute(&host, command).await?;
    if !output.is_empty() {
        info!("{}", output.trim_end());
    }
    if status != 0 {
        bail!("Command '{}' exited with status {}", command, status);
    }
    Ok(())
}

/// Runs the configured provisioning commands on the build VM, in order.
pub struct RunProvisioningHook {
    communicator: Arc<dyn Communicator>,
    commands: Vec<String>,
}

impl RunProvisioningHook {
    pub fn new(communicator: Arc<dyn Communicator>, commands: Vec<String>) -> Self {
        Self {
            communicator,
            commands,
        }
    }
}

#[async_trait]
impl Step for RunProvisioningHook {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        for command in &self.commands {
            if state.is_cancelled() {
                warn!("Provisioning interrupted");
                return StepAction::Halt;
            }
            if let Err(e) = run_command(self.communicator.as_ref(), state, command).await {
                return halt(state, self.name(), e);
            }
        }
        StepAction::Continue
    }
}

/// Deprovisions the guest agent and user before capture.
pub struct GeneralizeOs {
    communicator: Arc<dyn Communicator>,
    command: String,
}

impl GeneralizeOs {
    pub fn new(communicator: Arc<dyn Communicator>, command: impl Into<String>) -> Self {
        Self {
            communicator,
            command: command.into(),
        }
    }
}

#[async_trait]
impl Step for GeneralizeOs {
    fn name(&self) -> &str {
        "generalize-os"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        info!("Generalizing OS");
        match run_command(self.communicator.as_ref(), state, &self.command).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, self.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockArmClient, MockCommunicator};
    use crate::settings::mock_settings;
    use step_procedure::Pause;

    fn env() -> (Arc<StepEnv>, Arc<std::sync::Mutex<Vec<Duration>>>) {
        let (pause, sleeps) = Pause::recording();
        let env = StepEnv::new(MockArmClient::shared(), &mock_settings()).with_pause(pause);
        (Arc::new(env), sleeps)
    }

    #[tokio::test]
    async fn ssh_polled_until_reachable() {
        let (env, sleeps) = env();
        let comm = Arc::new(MockCommunicator::default());
        comm.unreachable_for(3);
        let state = StateBag::new();
        state.put(SSH_HOST, "10.0.0.4".to_string());

        let mut step = WaitForSsh::new(env, comm, Duration::from_secs(30));
        assert_eq!(step.run(&state).await, StepAction::Continue);
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![mock_settings().polling.ssh_interval; 3]
        );
    }

    #[tokio::test]
    async fn ssh_wait_cancelled() {
        let (env, _) = env();
        let comm = Arc::new(MockCommunicator::default());
        comm.unreachable_for(u32::MAX);
        let state = StateBag::new();
        state.put(SSH_HOST, "10.0.0.4".to_string());
        state.request_cancellation();

        let mut step = WaitForSsh::new(env, comm, Duration::from_secs(30));
        assert_eq!(step.run(&state).await, StepAction::Halt);
        assert_eq!(state.error(), None);
    }

    #[tokio::test]
    async fn provisioning_stops_at_failed_command() {
        let comm = Arc::new(MockCommunicator::default());
        comm.fail_command("false", 1);
        let state = StateBag::new();
        state.put(SSH_HOST, "10.0.0.4".to_string());

        let mut step = RunProvisioningHook::new(
            comm.clone(),
            vec!["true".to_string(), "false".to_string(), "echo".to_string()],
        );
        assert_eq!(step.run(&state).await, StepAction::Halt);
        assert_eq!(comm.commands(), vec!["true", "false"]);
        assert!(state.error().unwrap().contains("exited with status 1"));
    }

    #[tokio::test]
    async fn generalize_runs_command_on_host() {
        let comm = Arc::new(MockCommunicator::default());
        let state = StateBag::new();
        state.put(SSH_HOST, "10.0.0.4".to_string());

        let mut step = GeneralizeOs::new(comm.clone(), "sudo waagent -deprovision");
        assert_eq!(step.run(&state).await, StepAction::Continue);
        assert_eq!(
            comm.calls(),
            vec![(
                "10.0.0.4".to_string(),
                "sudo waagent -deprovision".to_string()
            )]
        );
    }
}
