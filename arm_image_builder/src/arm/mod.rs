use crate::retry::OpResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use step_procedure::{OperationHandle, OperationStatus, OperationTracker};
use thiserror::Error;

mod client;

pub use client::HttpArmClient;

/// Error reported by Azure Resource Manager, or produced locally while talking to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ArmError {
    /// HTTP status, `None` when the request never got a response
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
}

impl ArmError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport failure, the request did not complete
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "NetworkError".to_string(),
            message: message.into(),
        }
    }

    /// Failure on our side: bad request construction or unexpected payload
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "ClientError".to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// ARM error envelope: `{"error": {"code": "...", "message": "..."}}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceGroupState {
    Present,
    Deleting,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeploymentState {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Deleted,
    Other(String),
}

impl From<&str> for DeploymentState {
    fn from(s: &str) -> Self {
        match s {
            "Accepted" => DeploymentState::Accepted,
            "Running" => DeploymentState::Running,
            "Succeeded" => DeploymentState::Succeeded,
            "Failed" => DeploymentState::Failed,
            "Canceled" => DeploymentState::Canceled,
            "Deleted" => DeploymentState::Deleted,
            s => DeploymentState::Other(s.to_string()),
        }
    }
}

impl Display for DeploymentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Other(s) => write!(f, "{}", s),
            s => write!(f, "{:?}", s),
        }
    }
}

/// Power state from the VM instance view (`PowerState/<state>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VmPowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
    Unknown,
}

impl From<&str> for VmPowerState {
    fn from(s: &str) -> Self {
        match s {
            "starting" => VmPowerState::Starting,
            "running" => VmPowerState::Running,
            "stopping" => VmPowerState::Stopping,
            "stopped" => VmPowerState::Stopped,
            "deallocating" => VmPowerState::Deallocating,
            "deallocated" => VmPowerState::Deallocated,
            _ => VmPowerState::Unknown,
        }
    }
}

/// Template deployment request
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    pub resource_group: String,
    pub name: String,
    pub template: Value,
    pub parameters: Value,
}

/// Managed image to create from a generalized OS disk
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub resource_group: String,
    pub name: String,
    pub location: String,
    pub os_disk_id: String,
}

/// Calls into Azure Resource Manager used by the build steps.
///
/// Methods starting a long-running operation return its handle, or `None` when
/// ARM completed the request synchronously.
#[async_trait]
pub trait ArmClient: Send + Sync {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> OpResult<()>;

    async fn delete_resource_group(&self, name: &str) -> OpResult<Option<OperationHandle>>;

    /// `Absent` when ARM answers 404
    async fn resource_group_state(&self, name: &str) -> OpResult<ResourceGroupState>;

    async fn validate_deployment(&self, req: &DeploymentRequest) -> OpResult<()>;

    async fn create_deployment(&self, req: &DeploymentRequest)
    -> OpResult<Option<OperationHandle>>;

    async fn deployment_state(&self, resource_group: &str, name: &str)
    -> OpResult<DeploymentState>;

    async fn vm_power_state(&self, resource_group: &str, vm: &str) -> OpResult<VmPowerState>;

    async fn public_ip_address(&self, resource_group: &str, name: &str) -> OpResult<String>;

    async fn os_disk_id(&self, resource_group: &str, vm: &str) -> OpResult<String>;

    async fn deallocate_vm(&self, resource_group: &str, vm: &str)
    -> OpResult<Option<OperationHandle>>;

    async fn generalize_vm(&self, resource_group: &str, vm: &str) -> OpResult<()>;

    async fn create_image(&self, req: &ImageRequest) -> OpResult<Option<OperationHandle>>;

    /// Resource id of an existing image
    async fn image_id(&self, resource_group: &str, name: &str) -> OpResult<String>;

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> OpResult<OperationStatus<ArmError>>;
}

#[async_trait]
impl OperationTracker<ArmError> for dyn ArmClient {
    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> OpResult<OperationStatus<ArmError>> {
        ArmClient::operation_status(self, handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_codes() {
        assert_eq!(VmPowerState::from("running"), VmPowerState::Running);
        assert_eq!(VmPowerState::from("deallocated"), VmPowerState::Deallocated);
        assert_eq!(VmPowerState::from("hibernated"), VmPowerState::Unknown);
    }

    #[test]
    fn deployment_state_display() {
        assert_eq!(DeploymentState::from("Succeeded").to_string(), "Succeeded");
        assert_eq!(
            DeploymentState::from("Provisioning").to_string(),
            "Provisioning"
        );
    }

    #[test]
    fn error_envelope() -> anyhow::Result<()> {
        let e: ErrorEnvelope = serde_json::from_str(
            r#"{"error":{"code":"InvalidTemplate","message":"Deployment template validation failed"}}"#,
        )?;
        assert_eq!(e.error.code, "InvalidTemplate");
        assert_eq!(
            ArmError::new(400, e.error.code, e.error.message).to_string(),
            "InvalidTemplate: Deployment template validation failed"
        );
        Ok(())
    }
}
