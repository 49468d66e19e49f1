use crate::arm::ResourceGroupState;
use crate::state::{LOCATION, RESOURCE_GROUP, RESOURCE_GROUP_CREATED, TAGS};
use crate::steps::{StepEnv, halt};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use step_procedure::{
    CleanupResult, InterruptibleTask, OperationError, PollLimit, Readiness, StateBag, Step,
    StepAction, TaskOutcome,
};

/// Creates the temporary resource group; cleanup deletes it again.
pub struct CreateResourceGroup {
    env: Arc<StepEnv>,
}

impl CreateResourceGroup {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for CreateResourceGroup {
    fn name(&self) -> &str {
        "create-resource-group"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        let name = state.get(RESOURCE_GROUP);
        let location = state.get(LOCATION);
        let tags = state.try_get(TAGS).unwrap_or_default();
        info!("Creating resource group {} in {}", name, location);

        let client = self.env.client.clone();
        let mut policy = self.env.policy();
        let res = self
            .env
            .cancellable_executor(state)
            .execute_operation(&mut policy, || {
                client.create_resource_group(&name, &location, &tags)
            })
            .await;
        match res {
            Ok(()) => {
                state.put(RESOURCE_GROUP_CREATED, true);
                StepAction::Continue
            }
            Err(e) => halt(state, self.name(), e),
        }
    }

    async fn cleanup(&mut self, state: &StateBag) -> CleanupResult {
        if !state.try_get(RESOURCE_GROUP_CREATED).unwrap_or(false) {
            return Ok(());
        }
        let name = state.get(RESOURCE_GROUP);
        warn!("Removing resource group {} created by this build", name);
        delete_resource_group(&self.env, &name).await?;
        state.put(RESOURCE_GROUP_CREATED, false);
        Ok(())
    }
}

/// Delete a resource group and wait until ARM no longer knows it.
///
/// A group that is already gone counts as deleted.
pub async fn delete_resource_group(env: &StepEnv, name: &str) -> Result<()> {
    let mut policy = env.policy();
    let res = env
        .executor()
        .execute_async_operation(env.client.as_ref(), &mut policy, || {
            env.client.delete_resource_group(name)
        })
        .await;
    match res {
        Ok(()) => {}
        Err(OperationError::Provider(e)) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(anyhow!("Failed to delete resource group {}: {}", name, e)),
    }

    env.poller(
        format!("resource group {} deletion", name),
        env.polling.delete_interval,
        PollLimit::Deadline(env.polling.delete_timeout),
    )
    .poll_until_ready(&Readiness::new([ResourceGroupState::Absent]), || {
        env.client.resource_group_state(name)
    })
    .await?;
    info!("Resource group {} deleted", name);
    Ok(())
}

/// Deletes the temporary resource group at the end of a successful build.
///
/// Deletion races the cancellation flag; when cancelled the unwind of
/// [`CreateResourceGroup`] takes over.
pub struct DeleteResourceGroup {
    env: Arc<StepEnv>,
}

impl DeleteResourceGroup {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Step for DeleteResourceGroup {
    fn name(&self) -> &str {
        "delete-resource-group"
    }

    async fn run(&mut self, state: &StateBag) -> StepAction {
        if !state.try_get(RESOURCE_GROUP_CREATED).unwrap_or(false) {
            return StepAction::Continue;
        }
        let name = state.get(RESOURCE_GROUP);
        info!("Deleting resource group {}", name);

        let env = self.env.clone();
        let group = name.clone();
        let cancel = state.cancel_handle();
        let outcome = InterruptibleTask::new(move || cancel.is_cancelled())
            .run(async move { delete_resource_group(&env, &group).await })
            .await;

        match outcome {
            TaskOutcome::Completed(Ok(())) => {
                state.put(RESOURCE_GROUP_CREATED, false);
                StepAction::Continue
            }
            TaskOutcome::Completed(Err(e)) => halt(state, self.name(), e),
            TaskOutcome::Cancelled => {
                warn!("Deletion of resource group {} abandoned", name);
                StepAction::Halt
            }
        }
    }
}
