//! Driver configuration
//!
//! The binary fills a [`DriverConfig`] from command-line flags and
//! environment. Array connection fields may also come from a YAML file
//! (usually a mounted secret), which overrides the flags it sets.

use crate::controller::ControllerConfig;
use crate::error::{Error, Result};
use crate::gateway::RestGatewayConfig;
use crate::node::{LinuxHostConfig, NodeConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default plugin name reported by identity calls
pub const DEFAULT_DRIVER_NAME: &str = "csi-flexblock.billyronks.io";

/// Which services this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Controller,
    Node,
    #[default]
    Both,
}

impl Mode {
    pub fn runs_controller(&self) -> bool {
        matches!(self, Mode::Controller | Mode::Both)
    }

    pub fn runs_node(&self) -> bool {
        matches!(self, Mode::Node | Mode::Both)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Controller => write!(f, "controller"),
            Mode::Node => write!(f, "node"),
            Mode::Both => write!(f, "both"),
        }
    }
}

/// Array connection fields as they appear in the YAML file
///
/// ```yaml
/// endpoint: https://gateway.example:443
/// username: admin
/// password: secret
/// systemName: sys1
/// insecure: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub insecure: Option<bool>,
}

impl ArrayConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Overwrite the fields this file sets
    pub fn apply(self, gateway: &mut RestGatewayConfig) {
        if let Some(endpoint) = self.endpoint {
            gateway.endpoint = endpoint;
        }
        if let Some(username) = self.username {
            gateway.username = username;
        }
        if let Some(password) = self.password {
            gateway.password = password;
        }
        if let Some(system_name) = self.system_name {
            gateway.system_name = system_name;
        }
        if let Some(insecure) = self.insecure {
            gateway.insecure = insecure;
        }
    }
}

/// Everything the driver needs to start
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub mode: Mode,
    pub listen_addr: SocketAddr,
    /// Deadline applied when a caller sends none
    pub request_timeout: Duration,
    /// Probe the array/host before serving
    pub probe_on_start: bool,
    /// Use the in-memory array instead of a gateway
    pub simulate: bool,
    pub array: RestGatewayConfig,
    pub controller: ControllerConfig,
    pub node: NodeConfig,
    pub host: LinuxHostConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            mode: Mode::default(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9808)),
            request_timeout: Duration::from_secs(120),
            probe_on_start: false,
            simulate: false,
            array: RestGatewayConfig::default(),
            controller: ControllerConfig::default(),
            node: NodeConfig::default(),
            host: LinuxHostConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.driver_name.is_empty() {
            return Err(Error::Configuration("driver name must not be empty".into()));
        }
        if self.mode.runs_controller() && !self.simulate {
            self.array.validate()?;
        }
        if self.mode.runs_node() && !self.node.private_mount_dir.is_absolute() {
            return Err(Error::Configuration(format!(
                "private mount dir must be absolute: {}",
                self.node.private_mount_dir.display()
            )));
        }
        Ok(())
    }
}
