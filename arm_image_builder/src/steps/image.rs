use crate::arm::ImageRequest;
use crate::state::{
    IMAGE_ID, IMAGE_NAME, IMAGE_RESOURCE_GROUP, LOCATION, OS_DISK_ID, RESOURCE_GROUP, VM_NAME,
};
use crate::steps::{StepEnv, halt};
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use step_procedure::{StateBag, Step, StepAction};

/// Captures the generalized OS disk of the build VM as a managed image.
///
/// Writes [`OS_DISK_ID`] and [`IMAGE_ID`].
pub struct CaptureImage {
    env: Arc<StepEnv>,
}

impl CaptureImage {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    async fn capture(&self, state: &StateBag) -> Result<String> {
        let resource_group = state.get(RESOURCE_GROUP);
        let vm = state.get(VM_NAME);
        let client = &self.env.client;
        let executor = self.env.cancellable_executor(state);

        let mut policy = self.env.policy();
        let os_disk_id = executor
            .execute_operation(&mut policy, || client.os_disk_id(&resource_group, &vm))
            .await?;
        state.put(OS_DISK_ID, os_disk_id.clone());

        let req = ImageRequest {
            resource_group: state.get(IMAGE_RESOURCE_GROUP),
            name: state.get(IMAGE_NAME),
            location: state.get(LOCATION),
            os_disk_id,
        };
        info!(
            "Capturing image {}/{} from {}",
            req.resource_group, req.name, req.os_disk_id
        );
        let mut policy = self.env.policy();
        executor
            .execute_async_operation(client.as_ref(), &mut policy, || client.create_image(&req))
            .await?;

        let mut policy = self.env.policy();
        let image_id = executor
            .execute_operation(&mut policy, || {
                client.image_id(&req.resource_group, &req.name)
            })
            .await?;
        Ok(image_id)
    }
}

#[async_trait]
impl Step for CaptureImage {
    fn name(&self) -> &str {
        "capture-image"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        match self.capture(state).await {
            Ok(id) => {
                info!("Image captured: {}", id);
                state.put(IMAGE_ID, id);
                StepAction::Continue
            }
            Err(e) => halt(state, self.name(), e),
        }
    }
}
