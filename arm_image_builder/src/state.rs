//! Keys of the values shared between build steps.

use serde_json::Value;
use std::collections::HashMap;
use step_procedure::Key;

pub const LOCATION: Key<String> = Key::new("arm.location");
pub const RESOURCE_GROUP: Key<String> = Key::new("arm.resource_group");
pub const TAGS: Key<HashMap<String, String>> = Key::new("arm.tags");
pub const DEPLOYMENT_NAME: Key<String> = Key::new("arm.deployment_name");
pub const VM_NAME: Key<String> = Key::new("arm.vm_name");
pub const PUBLIC_IP_NAME: Key<String> = Key::new("arm.public_ip_name");
pub const TEMPLATE: Key<Value> = Key::new("arm.template");
pub const TEMPLATE_PARAMETERS: Key<Value> = Key::new("arm.template_parameters");
pub const IMAGE_RESOURCE_GROUP: Key<String> = Key::new("arm.image_resource_group");
pub const IMAGE_NAME: Key<String> = Key::new("arm.image_name");

/// Set by the step that created the temporary group, cleared once it is gone
pub const RESOURCE_GROUP_CREATED: Key<bool> = Key::new("arm.resource_group_created");

pub const SSH_HOST: Key<String> = Key::new("ssh.host");
pub const OS_DISK_ID: Key<String> = Key::new("arm.os_disk_id");
pub const IMAGE_ID: Key<String> = Key::new("arm.image_id");
