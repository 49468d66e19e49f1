use crate::arm::{ArmClient, HttpArmClient};
use crate::json_api::JsonApi;
use crate::tempname::TempNames;
use anyhow::{Context, Result, bail};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com/";
pub const DEFAULT_GENERALIZE_COMMAND: &str =
    "sudo /usr/sbin/waagent -force -deprovision+user && export HISTSIZE=0 && sync";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    pub subscription_id: String,

    /// Azure region for the temporary resources and the image
    pub location: String,

    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,

    pub credentials: Credentials,

    /// Names of the temporary resources, generated when not set
    #[serde(default)]
    pub temp: TempResourceConfig,

    /// Tags applied to the temporary resource group
    #[serde(default)]
    pub tags: HashMap<String, String>,

    pub template: TemplateConfig,

    pub ssh: SshConfig,

    /// Shell commands run on the VM before it is generalized
    #[serde(default)]
    pub provisioners: Vec<String>,

    #[serde(default = "default_generalize_command")]
    pub generalize_command: String,

    /// Where the captured image is stored
    pub image: ImageConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Log ARM request and response bodies
    #[serde(default)]
    pub log_requests: bool,

    /// Wait for ENTER before every step
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    /// Bearer token for the management API
    Token { token: String },
    /// Read the bearer token from an environment variable
    #[serde(rename_all = "kebab-case")]
    TokenEnv { variable: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TempResourceConfig {
    pub resource_group: Option<String>,
    pub deployment: Option<String>,
    pub vm: Option<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemplateConfig {
    /// ARM template JSON file
    pub file: PathBuf,
    /// Template parameter values, by name
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshConfig {
    pub username: String,
    pub private_key: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// How long to wait for the SSH port to open
    #[serde(default = "default_ssh_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageConfig {
    pub resource_group: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PollingConfig {
    /// Interval between async operation status checks
    #[serde(with = "humantime_serde")]
    pub operation_interval: Duration,
    /// Interval between deployment state checks
    #[serde(with = "humantime_serde")]
    pub deployment_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub deployment_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub vm_ready_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub vm_ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ssh_interval: Duration,
    /// Deadline for deleting the temporary resource group
    #[serde(with = "humantime_serde")]
    pub delete_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub delete_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            operation_interval: Duration::from_secs(5),
            deployment_interval: Duration::from_secs(15),
            deployment_timeout: Duration::from_secs(60 * 60),
            vm_ready_interval: Duration::from_secs(10),
            vm_ready_timeout: Duration::from_secs(10 * 60),
            ssh_interval: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(15 * 60),
            delete_interval: Duration::from_secs(10),
        }
    }
}

/// Replacement delays and budgets for the default retry rules
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySettings {
    pub throttling: Option<RuleOverride>,
    pub internal_error: Option<RuleOverride>,
    pub conflict: Option<RuleOverride>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleOverride {
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Cap for exponential rules
    #[serde(default, with = "humantime_serde")]
    pub max_delay: Option<Duration>,
    /// 0 = unbounded
    pub max_retries: u32,
}

fn default_management_endpoint() -> String {
    DEFAULT_MANAGEMENT_ENDPOINT.to_string()
}

fn default_generalize_command() -> String {
    DEFAULT_GENERALIZE_COMMAND.to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn token(&self) -> Result<String> {
        match &self.credentials {
            Credentials::Token { token } => Ok(token.clone()),
            Credentials::TokenEnv { variable } => std::env::var(variable)
                .with_context(|| format!("Environment variable {} is not set", variable)),
        }
    }

    /// Configured temporary names, with generated ones filling the gaps
    pub fn temp_names(&self) -> TempNames {
        let generated = TempNames::generate();
        TempNames {
            resource_group: self
                .temp
                .resource_group
                .clone()
                .unwrap_or(generated.resource_group),
            deployment: self
                .temp
                .deployment
                .clone()
                .unwrap_or(generated.deployment),
            vm: self.temp.vm.clone().unwrap_or(generated.vm),
            public_ip: self.temp.public_ip.clone().unwrap_or(generated.public_ip),
            ..generated
        }
    }

    /// Read the template file
    pub fn load_template(&self) -> Result<Value> {
        let text = std::fs::read_to_string(&self.template.file).with_context(|| {
            format!("Failed to read template {}", self.template.file.display())
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Template parameters in ARM form: `{"name": {"value": ...}}`
    pub fn template_parameters(&self) -> Value {
        Value::Object(
            self.template
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!({ "value": v })))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscription_id.is_empty() {
            bail!("subscription-id must be set");
        }
        if self.location.is_empty() {
            bail!("location must be set");
        }
        if self.image.name.is_empty() || self.image.resource_group.is_empty() {
            bail!("image name and resource-group must be set");
        }
        if self.temp.resource_group.as_ref() == Some(&self.image.resource_group) {
            bail!("The temporary resource group cannot be the image resource group");
        }
        Ok(())
    }

    pub fn get_client(&self) -> Result<Arc<dyn ArmClient>> {
        let api = JsonApi::token(&self.management_endpoint, &self.token()?, self.log_requests)?;
        Ok(Arc::new(HttpArmClient::new(api, &self.subscription_id)))
    }
}

#[cfg(test)]
pub fn mock_settings() -> Settings {
    Settings {
        subscription_id: "00000000-0000-0000-0000-000000000000".to_string(),
        location: "westeurope".to_string(),
        management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
        credentials: Credentials::Token {
            token: "token".to_string(),
        },
        temp: TempResourceConfig {
            resource_group: Some("packer-Resource-Group-test".to_string()),
            deployment: Some("pkrdptest".to_string()),
            vm: Some("pkrvmtest".to_string()),
            public_ip: Some("pkriptest".to_string()),
        },
        tags: HashMap::new(),
        template: TemplateConfig {
            file: PathBuf::from("template.json"),
            parameters: HashMap::from([(
                "vmSize".to_string(),
                Value::String("Standard_B2s".to_string()),
            )]),
        },
        ssh: SshConfig {
            username: "packer".to_string(),
            private_key: PathBuf::from("id_ed25519"),
            port: 22,
            timeout: Duration::from_secs(60),
        },
        provisioners: vec!["sudo apt-get update".to_string()],
        generalize_command: DEFAULT_GENERALIZE_COMMAND.to_string(),
        image: ImageConfig {
            resource_group: "images".to_string(),
            name: "ubuntu-base".to_string(),
        },
        polling: PollingConfig::default(),
        retry: RetrySettings::default(),
        log_requests: false,
        debug: false,
    }
}
