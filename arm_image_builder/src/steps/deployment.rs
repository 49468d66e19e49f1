use crate::arm::{DeploymentRequest, DeploymentState};
use crate::state::{
    DEPLOYMENT_NAME, PUBLIC_IP_NAME, RESOURCE_GROUP, SSH_HOST, TEMPLATE, TEMPLATE_PARAMETERS,
};
use crate::steps::{StepEnv, halt};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use step_procedure::{PollLimit, Readiness, StateBag, Step, StepAction};

fn deployment_request(state: &StateBag) -> DeploymentRequest {
    DeploymentRequest {
        resource_group: state.get(RESOURCE_GROUP),
        name: state.get(DEPLOYMENT_NAME),
        template: state.get(TEMPLATE),
        parameters: state.get(TEMPLATE_PARAMETERS),
    }
}

pub struct ValidateTemplate {
    env: Arc<StepEnv>,
}

impl ValidateTemplate {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for ValidateTemplate {
    fn name(&self) -> &str {
        "validate-template"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let req = deployment_request(state);
        info!("Validating deployment template {}", req.name);

        let client = &self.env.client;
        let mut policy = self.env.policy();
        let res = self
            .env
            .cancellable_executor(state)
            .execute_operation(&mut policy, || client.validate_deployment(&req))
            .await;
        match res {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, self.name(), e),
        }
    }
}

/// Submits the template deployment and waits for it to settle.
pub struct DeployTemplate {
    env: Arc<StepEnv>,
}

impl DeployTemplate {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    async fn deploy(&self, state: &StateBag) -> anyhow::Result<DeploymentState> {
        let req = deployment_request(state);
        info!(
            "Deploying template {} into {}",
            req.name, req.resource_group
        );

        let client = &self.env.client;
        let mut policy = self.env.policy();
        self.env
            .cancellable_executor(state)
            .execute_async_operation(client.as_ref(), &mut policy, || {
                client.create_deployment(&req)
            })
            .await?;

        let readiness = Readiness::new([DeploymentState::Succeeded]).failing([
            DeploymentState::Failed,
            DeploymentState::Canceled,
            DeploymentState::Deleted,
        ]);
        let deployed = self
            .env
            .cancellable_poller(
                state,
                format!("deployment {}", req.name),
                self.env.polling.deployment_interval,
                PollLimit::Deadline(self.env.polling.deployment_timeout),
            )
            .poll_until_ready(&readiness, || {
                client.deployment_state(&req.resource_group, &req.name)
            })
            .await?;
        Ok(deployed)
    }
}

#[async_trait]
impl Step for DeployTemplate {
    fn name(&self) -> &str {
        "deploy-template"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        match self.deploy(state).await {
            Ok(s) => {
                info!("Deployment finished: {}", s);
                StepAction::Continue
            }
            Err(e) => halt(state, self.name(), e),
        }
    }
}

/// Reads the public IP of the build VM into [`SSH_HOST`].
pub struct GetIpAddress {
    env: Arc<StepEnv>,
}

impl GetIpAddress {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for GetIpAddress {
    fn name(&self) -> &str {
        "get-ip-address"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let resource_group = state.get(RESOURCE_GROUP);
        let ip_name = state.get(PUBLIC_IP_NAME);

        let client = &self.env.client;
        let mut policy = self.env.policy();
        let res = self
            .env
            .cancellable_executor(state)
            .execute_operation(&mut policy, || {
                client.public_ip_address(&resource_group, &ip_name)
            })
            .await;
        match res {
            Ok(address) => {
                info!("SSH host is {}", address);
                state.put(SSH_HOST, address);
                StepAction::Continue
            }
            Err(e) => halt(state, self.name(), e),
        }
    }
}
