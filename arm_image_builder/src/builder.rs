use crate::arm::ArmClient;
use crate::settings::Settings;
use crate::ssh_client::Communicator;
use crate::state::{
    DEPLOYMENT_NAME, IMAGE_ID, IMAGE_NAME, IMAGE_RESOURCE_GROUP, LOCATION, PUBLIC_IP_NAME,
    RESOURCE_GROUP, TAGS, TEMPLATE, TEMPLATE_PARAMETERS, VM_NAME,
};
use crate::steps::{
    CaptureImage, CreateResourceGroup, DeleteResourceGroup, DeployTemplate, GeneralizeOs,
    GeneralizeVm, GetIpAddress, PowerOffVm, RunProvisioningHook, StepEnv, ValidateTemplate,
    WaitForSsh, WaitForVmReady,
};
use anyhow::Result;
use futures::FutureExt;
use log::{info, warn};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use step_procedure::{
    BoxFuture, CancelHandle, Events, LogSink, Pause, PauseHook, RunOutcome, StateBag, Step,
    StepRunner,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// The managed image produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub image_id: String,
    pub location: String,
    pub resource_group: String,
}

impl Display for Artifact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Azure managed image {} (resource group {}, location {})",
            self.image_id, self.resource_group, self.location
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Completed(Artifact),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub result: BuildResult,
    /// Cleanup failures, the resources they name may need manual removal
    pub cleanup_warnings: Vec<String>,
}

/// Builds one managed image from an ARM template.
pub struct Builder {
    settings: Settings,
    client: Arc<dyn ArmClient>,
    communicator: Arc<dyn Communicator>,
    cancel: CancelHandle,
    template: Option<Value>,
    pause: Pause,
    events: Events,
    pause_hook: Option<PauseHook>,
}

impl Builder {
    pub fn new(
        settings: Settings,
        client: Arc<dyn ArmClient>,
        communicator: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            settings,
            client,
            communicator,
            cancel: CancelHandle::new(),
            template: None,
            pause: Pause::default(),
            events: LogSink::shared(),
            pause_hook: None,
        }
    }

    /// Use `template` instead of reading the configured template file
    pub fn with_template(mut self, template: Value) -> Self {
        self.template = Some(template);
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

    /// Replaces the stdin prompt used in debug mode
    pub fn with_pause_hook(mut self, hook: PauseHook) -> Self {
        self.pause_hook = Some(hook);
        self
    }

    /// Flag observed by every step, set it to abort the build
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn seed_state(&self, template: Value) -> StateBag {
        let names = self.settings.temp_names();
        let state = StateBag::with_cancel(self.cancel.clone());
        state.put(LOCATION, self.settings.location.clone());
        state.put(TAGS, self.settings.tags.clone());
        state.put(RESOURCE_GROUP, names.resource_group);
        state.put(DEPLOYMENT_NAME, names.deployment);
        state.put(VM_NAME, names.vm);
        state.put(PUBLIC_IP_NAME, names.public_ip);
        state.put(TEMPLATE, template);
        state.put(TEMPLATE_PARAMETERS, self.settings.template_parameters());
        state.put(IMAGE_RESOURCE_GROUP, self.settings.image.resource_group.clone());
        state.put(IMAGE_NAME, self.settings.image.name.clone());
        state
    }

    fn steps(&self, env: Arc<StepEnv>) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(CreateResourceGroup::new(env.clone())),
            Box::new(ValidateTemplate::new(env.clone())),
            Box::new(DeployTemplate::new(env.clone())),
            Box::new(GetIpAddress::new(env.clone())),
            Box::new(WaitForVmReady::new(env.clone())),
            Box::new(WaitForSsh::new(
                env.clone(),
                self.communicator.clone(),
                self.settings.ssh.timeout,
            )),
            Box::new(RunProvisioningHook::new(
                self.communicator.clone(),
                self.settings.provisioners.clone(),
            )),
            Box::new(GeneralizeOs::new(
                self.communicator.clone(),
                self.settings.generalize_command.clone(),
            )),
            Box::new(PowerOffVm::new(env.clone())),
            Box::new(GeneralizeVm::new(env.clone())),
            Box::new(CaptureImage::new(env.clone())),
            Box::new(DeleteResourceGroup::new(env)),
        ]
    }

    pub async fn run(mut self) -> Result<BuildReport> {
        let template = match self.template.take() {
            Some(t) => t,
            None => self.settings.load_template()?,
        };
        let state = self.seed_state(template);
        let env = Arc::new(
            StepEnv::new(self.client.clone(), &self.settings)
                .with_pause(self.pause.clone())
                .with_events(self.events.clone()),
        );

        let mut runner = StepRunner::new(self.steps(env)).with_events(self.events.clone());
        match self.pause_hook.take() {
            Some(hook) => runner = runner.with_pause_hook(hook),
            None if self.settings.debug => runner = runner.with_pause_hook(stdin_pause_hook()),
            None => {}
        }

        info!(
            "Building image {}/{} in {}",
            self.settings.image.resource_group, self.settings.image.name, self.settings.location
        );
        let report = runner.run(&state).await;

        let result = match report.outcome {
            RunOutcome::Completed => match state.try_get(IMAGE_ID) {
                Some(image_id) => BuildResult::Completed(Artifact {
                    image_id,
                    location: self.settings.location.clone(),
                    resource_group: self.settings.image.resource_group.clone(),
                }),
                None => BuildResult::Failed("Build finished without an image".to_string()),
            },
            RunOutcome::Cancelled { .. } => BuildResult::Cancelled,
            RunOutcome::Halted { step, error, .. } => {
                BuildResult::Failed(error.unwrap_or_else(|| format!("{} halted", step)))
            }
        };
        Ok(BuildReport {
            result,
            cleanup_warnings: report.cleanup_warnings,
        })
    }
}

/// Debug mode: wait for ENTER before every step
fn stdin_pause_hook() -> PauseHook {
    Box::new(|index: usize, name: &str| -> BoxFuture<'static, ()> {
        let name = name.to_string();
        async move {
            println!(
                "Pausing before step {} ({}). Press ENTER to continue.",
                index + 1,
                name
            );
            wait_for_enter(&mut BufReader::new(tokio::io::stdin())).await;
        }
        .boxed()
    })
}

/// `false` on end of input or a read error, in which case the build goes on
async fn wait_for_enter<R: AsyncBufRead + Unpin>(reader: &mut R) -> bool {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(n) => n > 0,
        Err(e) => {
            warn!("Failed to read from stdin, continuing: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{DeploymentState, VmPowerState};
    use crate::mocks::{MockArmClient, MockCommunicator};
    use crate::settings::mock_settings;
    use serde_json::json;
    use std::sync::Mutex;
    use step_procedure::{EngineEvent, OpError, RecordingSink};

    fn template() -> Value {
        json!({
            "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#",
            "contentVersion": "1.0.0.0",
            "resources": []
        })
    }

    fn builder(client: Arc<MockArmClient>, comm: Arc<MockCommunicator>) -> Builder {
        let (pause, _) = Pause::recording();
        Builder::new(mock_settings(), client, comm)
            .with_template(template())
            .with_pause(pause)
    }

    #[tokio::test]
    async fn build_produces_image() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        client.script_deployment([DeploymentState::Accepted, DeploymentState::Running]);
        client.script_power([VmPowerState::Starting]);

        let report = builder(client.clone(), comm.clone()).run().await?;
        let BuildResult::Completed(artifact) = report.result else {
            panic!("expected completed build, got {:?}", report.result);
        };
        assert_eq!(
            artifact.image_id,
            "/subscriptions/mock/resourceGroups/images/providers/Microsoft.Compute/images/ubuntu-base"
        );
        assert_eq!(artifact.location, "westeurope");
        assert_eq!(artifact.resource_group, "images");
        assert!(report.cleanup_warnings.is_empty());

        // temporary group gone, image kept
        assert!(!client.has_group("packer-Resource-Group-test"));
        assert!(client.images.lock().unwrap().contains_key("ubuntu-base"));
        assert!(client.deallocated.lock().unwrap().contains("pkrvmtest"));
        assert!(client.generalized.lock().unwrap().contains("pkrvmtest"));
        assert_eq!(
            comm.commands(),
            vec!["sudo apt-get update".to_string(), mock_settings().generalize_command]
        );
        Ok(())
    }

    #[tokio::test]
    async fn image_request_uses_os_disk() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        builder(client.clone(), comm).run().await?;

        let images = client.images.lock().unwrap();
        let req = images.get("ubuntu-base").unwrap();
        assert_eq!(req.resource_group, "images");
        assert_eq!(req.location, "westeurope");
        assert!(req.os_disk_id.ends_with("/disks/pkrvmtest-osdisk"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_deployment_removes_group() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        client.script_deployment([DeploymentState::Running, DeploymentState::Failed]);

        let report = builder(client.clone(), comm.clone()).run().await?;
        let BuildResult::Failed(error) = report.result else {
            panic!("expected failed build, got {:?}", report.result);
        };
        assert!(error.contains("failure state Failed"), "{}", error);
        assert!(!client.has_group("packer-Resource-Group-test"));
        assert_eq!(client.call_count("delete_resource_group"), 1);
        assert!(comm.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_provisioning_command_halts() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        comm.fail_command("sudo apt-get update", 100);

        let report = builder(client.clone(), comm.clone()).run().await?;
        assert_eq!(
            report.result,
            BuildResult::Failed("Command 'sudo apt-get update' exited with status 100".to_string())
        );
        assert_eq!(client.call_count("deallocate_vm"), 0);
        assert!(!client.has_group("packer-Resource-Group-test"));
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_failure_is_reported() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        client.fail_times("create_image", 1, 400, "InvalidParameter");
        client.fail_times("delete_resource_group", 1, 403, "AuthorizationFailed");

        let report = builder(client.clone(), comm).run().await?;
        assert!(matches!(report.result, BuildResult::Failed(_)));
        assert_eq!(report.cleanup_warnings.len(), 1);
        assert!(report.cleanup_warnings[0].starts_with("create-resource-group"));
        assert!(report.cleanup_warnings[0].contains("AuthorizationFailed"));
        assert!(client.has_group("packer-Resource-Group-test"));
        Ok(())
    }

    #[tokio::test]
    async fn enter_prompt_survives_bad_input() {
        assert!(wait_for_enter(&mut &b"\n"[..]).await);
        assert!(!wait_for_enter(&mut &b""[..]).await);
        // invalid utf-8 fails the read
        assert!(!wait_for_enter(&mut &b"\xff\n"[..]).await);
    }

    #[tokio::test]
    async fn cancel_before_step_unwinds() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        let b = builder(client.clone(), comm.clone());
        let cancel = b.cancel_handle();
        let hook: PauseHook = Box::new(move |index: usize, _name: &str| -> BoxFuture<'static, ()> {
            // cancel before power off
            if index == 8 {
                cancel.cancel();
            }
            std::future::ready(()).boxed()
        });

        let report = b.with_pause_hook(hook).run().await?;
        assert_eq!(report.result, BuildResult::Cancelled);
        assert_eq!(client.call_count("deallocate_vm"), 0);
        assert!(!client.has_group("packer-Resource-Group-test"));
        Ok(())
    }

    #[tokio::test]
    async fn throttled_create_is_retried() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        client.fail_times("create_resource_group", 2, 429, "TooManyRequests");
        let sink = RecordingSink::new();

        let report = builder(client.clone(), comm)
            .with_events(sink.clone())
            .run()
            .await?;
        assert!(matches!(report.result, BuildResult::Completed(_)));
        assert_eq!(client.call_count("create_resource_group"), 3);
        let retries = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::RetryScheduled { .. }))
            .count();
        assert_eq!(retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn network_errors_exhaust_to_failure() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        for _ in 0..11 {
            client.fail(
                "validate_deployment",
                OpError::Transient(crate::arm::ArmError::network("connection reset")),
            );
        }

        let report = builder(client.clone(), comm).run().await?;
        let BuildResult::Failed(error) = report.result else {
            panic!("expected failure");
        };
        assert!(error.starts_with("network error"), "{}", error);
        assert_eq!(client.call_count("validate_deployment"), 11);
        assert!(!client.has_group("packer-Resource-Group-test"));
        Ok(())
    }

    #[tokio::test]
    async fn debug_hook_sees_every_step() -> Result<()> {
        let client = MockArmClient::shared();
        let comm = Arc::new(MockCommunicator::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let hook: PauseHook = Box::new(move |_index: usize, name: &str| -> BoxFuture<'static, ()> {
            s.lock().unwrap().push(name.to_string());
            std::future::ready(()).boxed()
        });

        builder(client, comm).with_pause_hook(hook).run().await?;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "create-resource-group",
                "validate-template",
                "deploy-template",
                "get-ip-address",
                "wait-for-vm-ready",
                "wait-for-ssh",
                "provision",
                "generalize-os",
                "power-off-vm",
                "generalize-vm",
                "capture-image",
                "delete-resource-group",
            ]
        );
        Ok(())
    }
}
