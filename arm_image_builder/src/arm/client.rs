use crate::arm::{
    ArmClient, ArmError, DeploymentRequest, DeploymentState, ErrorDetail, ImageRequest,
    ResourceGroupState, VmPowerState,
};
use crate::json_api::JsonApi;
use crate::op_fatal;
use crate::retry::{OpError, OpResult};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use step_procedure::{OperationHandle, OperationStatus};

const RESOURCES_API: &str = "2021-04-01";
const COMPUTE_API: &str = "2023-03-01";
const NETWORK_API: &str = "2023-04-01";

/// [`ArmClient`] over the ARM REST API.
pub struct HttpArmClient {
    api: JsonApi,
    subscription_id: String,
}

impl HttpArmClient {
    pub fn new(api: JsonApi, subscription_id: &str) -> Self {
        Self {
            api,
            subscription_id: subscription_id.to_string(),
        }
    }

    fn group_path(&self, resource_group: &str) -> String {
        format!(
            "subscriptions/{}/resourcegroups/{}",
            self.subscription_id, resource_group
        )
    }

    fn deployment_path(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Resources/deployments/{}",
            self.group_path(resource_group),
            name
        )
    }

    fn vm_path(&self, resource_group: &str, vm: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.group_path(resource_group),
            vm
        )
    }

    fn image_path(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/images/{}",
            self.group_path(resource_group),
            name
        )
    }

    fn deployment_body(req: &DeploymentRequest) -> Value {
        json!({
            "properties": {
                "mode": "Incremental",
                "template": req.template,
                "parameters": req.parameters,
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningProperties {
    provisioning_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProvisionedResource {
    properties: Option<ProvisioningProperties>,
}

impl ProvisionedResource {
    fn provisioning_state(&self) -> Option<&str> {
        self.properties
            .as_ref()
            .and_then(|p| p.provisioning_state.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceViewStatus>,
}

#[derive(Debug, Deserialize)]
struct InstanceViewStatus {
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpProperties {
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicIp {
    properties: PublicIpProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    properties: VirtualMachineProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachineProperties {
    storage_profile: StorageProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    os_disk: OsDisk,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsDisk {
    managed_disk: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
struct ResourceId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatusBody {
    status: Option<String>,
    error: Option<ErrorDetail>,
}

#[async_trait]
impl ArmClient for HttpArmClient {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &HashMap<String, String>,
    ) -> OpResult<()> {
        let body = json!({ "location": location, "tags": tags });
        self.api
            .put::<Value, _>(&self.group_path(name), RESOURCES_API, body)
            .await?;
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> OpResult<Option<OperationHandle>> {
        let rsp = self.api.delete(&self.group_path(name), RESOURCES_API).await?;
        Ok(rsp.async_operation.map(OperationHandle::new))
    }

    async fn resource_group_state(&self, name: &str) -> OpResult<ResourceGroupState> {
        let rsp: ProvisionedResource =
            match self.api.get(&self.group_path(name), RESOURCES_API).await {
                Ok(r) => r,
                Err(OpError::Fatal(e)) if e.is_not_found() => return Ok(ResourceGroupState::Absent),
                Err(e) => return Err(e),
            };
        Ok(match rsp.provisioning_state() {
            Some("Deleting") => ResourceGroupState::Deleting,
            _ => ResourceGroupState::Present,
        })
    }

    async fn validate_deployment(&self, req: &DeploymentRequest) -> OpResult<()> {
        let path = format!("{}/validate", self.deployment_path(&req.resource_group, &req.name));
        self.api
            .post::<Value, _>(&path, RESOURCES_API, Some(Self::deployment_body(req)))
            .await?;
        Ok(())
    }

    async fn create_deployment(
        &self,
        req: &DeploymentRequest,
    ) -> OpResult<Option<OperationHandle>> {
        let rsp = self
            .api
            .put::<Value, _>(
                &self.deployment_path(&req.resource_group, &req.name),
                RESOURCES_API,
                Self::deployment_body(req),
            )
            .await?;
        Ok(rsp.async_operation.map(OperationHandle::new))
    }

    async fn deployment_state(
        &self,
        resource_group: &str,
        name: &str,
    ) -> OpResult<DeploymentState> {
        let rsp: ProvisionedResource = self
            .api
            .get(&self.deployment_path(resource_group, name), RESOURCES_API)
            .await?;
        match rsp.provisioning_state() {
            Some(s) => Ok(DeploymentState::from(s)),
            None => op_fatal!("Deployment {} has no provisioning state", name),
        }
    }

    async fn vm_power_state(&self, resource_group: &str, vm: &str) -> OpResult<VmPowerState> {
        let path = format!("{}/instanceView", self.vm_path(resource_group, vm));
        let view: InstanceView = self.api.get(&path, COMPUTE_API).await?;
        Ok(view
            .statuses
            .iter()
            .find_map(|s| s.code.strip_prefix("PowerState/"))
            .map(VmPowerState::from)
            .unwrap_or(VmPowerState::Unknown))
    }

    async fn public_ip_address(&self, resource_group: &str, name: &str) -> OpResult<String> {
        let path = format!(
            "{}/providers/Microsoft.Network/publicIPAddresses/{}",
            self.group_path(resource_group),
            name
        );
        let ip: PublicIp = self.api.get(&path, NETWORK_API).await?;
        match ip.properties.ip_address {
            Some(a) => Ok(a),
            None => op_fatal!("Public IP {} has no address assigned", name),
        }
    }

    async fn os_disk_id(&self, resource_group: &str, vm: &str) -> OpResult<String> {
        let machine: VirtualMachine = self
            .api
            .get(&self.vm_path(resource_group, vm), COMPUTE_API)
            .await?;
        match machine.properties.storage_profile.os_disk.managed_disk {
            Some(d) => Ok(d.id),
            None => op_fatal!("VM {} has no managed OS disk", vm),
        }
    }

    async fn deallocate_vm(
        &self,
        resource_group: &str,
        vm: &str,
    ) -> OpResult<Option<OperationHandle>> {
        let path = format!("{}/deallocate", self.vm_path(resource_group, vm));
        let rsp = self.api.post::<Value, ()>(&path, COMPUTE_API, None).await?;
        Ok(rsp.async_operation.map(OperationHandle::new))
    }

    async fn generalize_vm(&self, resource_group: &str, vm: &str) -> OpResult<()> {
        let path = format!("{}/generalize", self.vm_path(resource_group, vm));
        self.api.post::<Value, ()>(&path, COMPUTE_API, None).await?;
        Ok(())
    }

    async fn create_image(&self, req: &ImageRequest) -> OpResult<Option<OperationHandle>> {
        let body = json!({
            "location": req.location,
            "properties": {
                "storageProfile": {
                    "osDisk": {
                        "osType": "Linux",
                        "osState": "Generalized",
                        "managedDisk": { "id": req.os_disk_id },
                    }
                }
            }
        });
        let rsp = self
            .api
            .put::<Value, _>(
                &self.image_path(&req.resource_group, &req.name),
                COMPUTE_API,
                body,
            )
            .await?;
        Ok(rsp.async_operation.map(OperationHandle::new))
    }

    async fn image_id(&self, resource_group: &str, name: &str) -> OpResult<String> {
        let image: ResourceId = self
            .api
            .get(&self.image_path(resource_group, name), COMPUTE_API)
            .await?;
        Ok(image.id)
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> OpResult<OperationStatus<ArmError>> {
        let rsp = self
            .api
            .get_url::<OperationStatusBody>(handle.as_str())
            .await?;
        let status = rsp.status;
        let Some(body) = rsp.body else {
            // Location style polling: 202 until done, then 200/204
            return Ok(if status == 202 {
                OperationStatus::InProgress
            } else {
                OperationStatus::Succeeded
            });
        };

        debug!("Operation {} status {:?}", handle, body.status);
        Ok(match body.status.as_deref() {
            Some("Succeeded") => OperationStatus::Succeeded,
            Some("Canceled") => OperationStatus::Canceled,
            Some("Failed") => OperationStatus::Failed(match body.error {
                Some(e) => ArmError::new(status, e.code, e.message),
                None => ArmError::new(status, "OperationFailed", format!("{} failed", handle)),
            }),
            Some(_) => OperationStatus::InProgress,
            None if status == 202 => OperationStatus::InProgress,
            None => OperationStatus::Succeeded,
        })
    }
}
