#![allow(unused)]
use crate::arm::{
    ArmClient, ArmError, DeploymentRequest, DeploymentState, ImageRequest, ResourceGroupState,
    VmPowerState,
};
use crate::retry::OpResult;
use crate::ssh_client::Communicator;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use step_procedure::{OpError, OperationHandle, OperationStatus};

pub const MOCK_IP: &str = "10.0.0.4";

/// In-memory ARM.
///
/// Long-running calls apply their effect when started and hand out an
/// operation handle; [`MockArmClient::script_operations`] controls what the
/// handles report.
#[derive(Debug, Default)]
pub struct MockArmClient {
    pub groups: Mutex<HashMap<String, HashMap<String, String>>>,
    pub deployments: Mutex<HashMap<String, DeploymentRequest>>,
    pub images: Mutex<HashMap<String, ImageRequest>>,
    pub deallocated: Mutex<HashSet<String>>,
    pub generalized: Mutex<HashSet<String>>,
    group_states: Mutex<VecDeque<ResourceGroupState>>,
    deployment_states: Mutex<VecDeque<DeploymentState>>,
    power_states: Mutex<VecDeque<VmPowerState>>,
    operation_statuses: Mutex<VecDeque<OperationStatus<ArmError>>>,
    failures: Mutex<HashMap<&'static str, VecDeque<OpError<ArmError>>>>,
    calls: Mutex<Vec<String>>,
    next_operation: AtomicU64,
}

impl MockArmClient {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next call of `method` fail with `error`
    pub fn fail(&self, method: &'static str, error: OpError<ArmError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Make the next `n` calls of `method` fail with a provider error `code`
    pub fn fail_times(&self, method: &'static str, n: usize, status: u16, code: &str) {
        for _ in 0..n {
            self.fail(
                method,
                OpError::Fatal(ArmError::new(status, code, "mock failure")),
            );
        }
    }

    /// Statuses reported by the next operation status queries, then `Succeeded`
    pub fn script_operations(&self, statuses: impl IntoIterator<Item = OperationStatus<ArmError>>) {
        self.operation_statuses.lock().unwrap().extend(statuses);
    }

    pub fn script_group_states(&self, states: impl IntoIterator<Item = ResourceGroupState>) {
        self.group_states.lock().unwrap().extend(states);
    }

    /// States reported by the next deployment queries, then `Succeeded`
    pub fn script_deployment(&self, states: impl IntoIterator<Item = DeploymentState>) {
        self.deployment_states.lock().unwrap().extend(states);
    }

    /// States reported by the next power state queries, then `Running`
    pub fn script_power(&self, states: impl IntoIterator<Item = VmPowerState>) {
        self.power_states.lock().unwrap().extend(states);
    }

    /// Every method call, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.lock().unwrap().contains_key(name)
    }

    fn enter(&self, method: &'static str) -> OpResult<()> {
        self.calls.lock().unwrap().push(method.to_string());
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start_operation(&self) -> Option<OperationHandle> {
        let id = self.next_operation.fetch_add(1, Ordering::SeqCst);
        Some(OperationHandle::new(format!("mock-op-{}", id)))
    }

    fn not_found(what: &str) -> OpError<ArmError> {
        OpError::Fatal(ArmError::new(
            404,
            "NotFound",
            format!("{} was not found", what),
        ))
    }
}

#[async_trait]
impl ArmClient for MockArmClient {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> OpResult<()> {
        self.enter("create_resource_group")?;
        self.groups
            .lock()
            .unwrap()
            .insert(name.to_string(), tags.clone());
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> OpResult<Option<OperationHandle>> {
        self.enter("delete_resource_group")?;
        if self.groups.lock().unwrap().remove(name).is_none() {
            return Err(Self::not_found(name));
        }
        Ok(self.start_operation())
    }

    async fn resource_group_state(&self, name: &str) -> OpResult<ResourceGroupState> {
        self.enter("resource_group_state")?;
        if let Some(s) = self.group_states.lock().unwrap().pop_front() {
            return Ok(s);
        }
        if self.groups.lock().unwrap().contains_key(name) {
            Ok(ResourceGroupState::Present)
        } else {
            Ok(ResourceGroupState::Absent)
        }
    }

    async fn validate_deployment(&self, req: &DeploymentRequest) -> OpResult<()> {
        self.enter("validate_deployment")?;
        if !self.groups.lock().unwrap().contains_key(&req.resource_group) {
            return Err(Self::not_found(&req.resource_group));
        }
        Ok(())
    }

    async fn create_deployment(
        &self,
        req: &DeploymentRequest,
    ) -> OpResult<Option<OperationHandle>> {
        self.enter("create_deployment")?;
        self.deployments
            .lock()
            .unwrap()
            .insert(req.name.clone(), req.clone());
        Ok(self.start_operation())
    }

    async fn deployment_state(
        &self,
        resource_group: &str,
        name: &str,
    ) -> OpResult<DeploymentState> {
        self.enter("deployment_state")?;
        if !self.deployments.lock().unwrap().contains_key(name) {
            return Err(Self::not_found(name));
        }
        Ok(self
            .deployment_states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeploymentState::Succeeded))
    }

    async fn vm_power_state(&self, resource_group: &str, vm: &str) -> OpResult<VmPowerState> {
        self.enter("vm_power_state")?;
        Ok(self
            .power_states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(VmPowerState::Running))
    }

    async fn public_ip_address(&self, resource_group: &str, name: &str) -> OpResult<String> {
        self.enter("public_ip_address")?;
        Ok(MOCK_IP.to_string())
    }

    async fn os_disk_id(&self, resource_group: &str, vm: &str) -> OpResult<String> {
        self.enter("os_disk_id")?;
        Ok(format!(
            "/subscriptions/mock/resourceGroups/{}/providers/Microsoft.Compute/disks/{}-osdisk",
            resource_group, vm
        ))
    }

    async fn deallocate_vm(
        &self,
        resource_group: &str,
        vm: &str,
    ) -> OpResult<Option<OperationHandle>> {
        self.enter("deallocate_vm")?;
        self.deallocated.lock().unwrap().insert(vm.to_string());
        Ok(self.start_operation())
    }

    async fn generalize_vm(&self, resource_group: &str, vm: &str) -> OpResult<()> {
        self.enter("generalize_vm")?;
        self.generalized.lock().unwrap().insert(vm.to_string());
        Ok(())
    }

    async fn create_image(&self, req: &ImageRequest) -> OpResult<Option<OperationHandle>> {
        self.enter("create_image")?;
        self.images
            .lock()
            .unwrap()
            .insert(req.name.clone(), req.clone());
        Ok(self.start_operation())
    }

    async fn image_id(&self, resource_group: &str, name: &str) -> OpResult<String> {
        self.enter("image_id")?;
        if !self.images.lock().unwrap().contains_key(name) {
            return Err(Self::not_found(name));
        }
        Ok(format!(
            "/subscriptions/mock/resourceGroups/{}/providers/Microsoft.Compute/images/{}",
            resource_group, name
        ))
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> OpResult<OperationStatus<ArmError>> {
        self.enter("operation_status")?;
        Ok(self
            .operation_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OperationStatus::Succeeded))
    }
}

/// Records commands instead of running them; every command exits 0 unless
/// configured otherwise.
#[derive(Debug, Default)]
pub struct MockCommunicator {
    exit_codes: Mutex<HashMap<String, i32>>,
    calls: Mutex<Vec<(String, String)>>,
    unreachable: AtomicU32,
}

impl MockCommunicator {
    /// Report the host unreachable for the next `n` checks
    pub fn unreachable_for(&self, n: u32) {
        self.unreachable.store(n, Ordering::SeqCst);
    }

    pub fn fail_command(&self, command: &str, status: i32) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(command.to_string(), status);
    }

    /// `(host, command)` pairs in execution order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }
}

#[async_trait]
impl Communicator for MockCommunicator {
    async fn execute(&self, host: &str, command: &str) -> anyhow::Result<(i32, String)> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));
        let status = self
            .exit_codes
            .lock()
            .unwrap()
            .get(command)
            .copied()
            .unwrap_or(0);
        Ok((status, format!("ran {}", command)))
    }

    async fn is_reachable(&self, host: &str) -> bool {
        self.unreachable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}
