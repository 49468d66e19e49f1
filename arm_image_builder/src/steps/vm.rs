use crate::arm::VmPowerState;
use crate::state::{RESOURCE_GROUP, VM_NAME};
use crate::steps::{StepEnv, halt};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use step_procedure::{PollLimit, Readiness, StateBag, Step, StepAction};

/// Waits for the build VM to report `PowerState/running`.
pub struct WaitForVmReady {
    env: Arc<StepEnv>,
}

impl WaitForVmReady {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for WaitForVmReady {
    fn name(&self) -> &str {
        "wait-for-vm-ready"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let resource_group = state.get(RESOURCE_GROUP);
        let vm = state.get(VM_NAME);

        let readiness = Readiness::new([VmPowerState::Running])
            .failing([VmPowerState::Stopped, VmPowerState::Deallocated]);
        let client = &self.env.client;
        let res = self
            .env
            .cancellable_poller(
                state,
                format!("vm {}", vm),
                self.env.polling.vm_ready_interval,
                PollLimit::Deadline(self.env.polling.vm_ready_timeout),
            )
            .poll_until_ready(&readiness, || client.vm_power_state(&resource_group, &vm))
            .await;
        match res {
            Ok(_) => {
                info!("VM {} is running", vm);
                StepAction::Continue
            }
            Err(e) => halt(state, self.name(), e),
        }
    }
}

/// Stops and deallocates the VM so its disk can be captured.
pub struct PowerOffVm {
    env: Arc<StepEnv>,
}

impl PowerOffVm {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for PowerOffVm {
    fn name(&self) -> &str {
        "power-off-vm"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let resource_group = state.get(RESOURCE_GROUP);
        let vm = state.get(VM_NAME);
        info!("Deallocating VM {}", vm);

        let client = &self.env.client;
        let mut policy = self.env.policy();
        let res = self
            .env
            .cancellable_executor(state)
            .execute_async_operation(client.as_ref(), &mut policy, || {
                client.deallocate_vm(&resource_group, &vm)
            })
            .await;
        match res {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, self.name(), e),
        }
    }
}

pub struct GeneralizeVm {
    env: Arc<StepEnv>,
}

impl GeneralizeVm {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for GeneralizeVm {
    fn name(&self) -> &str {
        "generalize-vm"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let resource_group = state.get(RESOURCE_GROUP);
        let vm = state.get(VM_NAME);
        info!("Marking VM {} as generalized", vm);

        let client = &self.env.client;
        let mut policy = self.env.policy();
        let res = self
            .env
            .cancellable_executor(state)
            .execute_operation(&mut policy, || client.generalize_vm(&resource_group, &vm))
            .await;
        match res {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, self.name(), e),
        }
    }
}
