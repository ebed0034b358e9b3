//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{VpnError, VpnResult};

const REDACTED: &str = "********";

/// Main vpnctl agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Host-level settings
    #[serde(default)]
    pub agent: AgentSettings,
    /// Local IPsec process settings
    #[serde(default)]
    pub ipsec: IpsecSettings,
    /// Openswan binary settings
    #[serde(default)]
    pub openswan: OpenswanSettings,
    /// Remote router appliance; absent means local processes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appliance: Option<ApplianceSettings>,
    /// Orchestrator endpoint
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Host name reported to the orchestrator
    #[serde(default = "default_host")]
    pub host: String,
    /// Runtime state directory
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Where named network namespaces are mounted
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,
    /// Router namespace name prefix
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
    /// Command prefix for privileged execution (e.g. "sudo")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_helper: Option<String>,
}

/// Which keying daemon family drives local processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessBackendKind {
    #[default]
    Openswan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsecSettings {
    /// Per-process configuration trees live here (default: <state_path>/ipsec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_base_dir: Option<PathBuf>,
    /// Reconciliation interval (seconds)
    #[serde(default = "default_status_check_interval")]
    pub status_check_interval: u64,
    /// Backend selected at process creation
    #[serde(default)]
    pub process_backend: ProcessBackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenswanSettings {
    /// The `ipsec` front-end binary
    #[serde(default = "default_ipsec_binary")]
    pub binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceSettings {
    /// Management address of the appliance
    pub host: String,
    /// REST port
    #[serde(default = "default_appliance_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Request timeout (seconds)
    #[serde(default = "default_appliance_timeout")]
    pub timeout_secs: u64,
    /// Verify the appliance TLS certificate
    #[serde(default)]
    pub verify_tls: bool,
    /// Appliance interface carrying tunnel traffic
    #[serde(default = "default_local_interface")]
    pub local_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Base URL of the orchestrator RPC endpoint
    #[serde(default = "default_orchestrator_endpoint")]
    pub endpoint: String,
    /// Topic the driver API is published under
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/vpnctl")
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/var/run/netns")
}

fn default_namespace_prefix() -> String {
    "qrouter-".to_string()
}

fn default_status_check_interval() -> u64 {
    60
}

fn default_ipsec_binary() -> String {
    "ipsec".to_string()
}

fn default_appliance_port() -> u16 {
    55443
}

fn default_appliance_timeout() -> u64 {
    30
}

fn default_local_interface() -> String {
    "GigabitEthernet3".to_string()
}

fn default_orchestrator_endpoint() -> String {
    "http://127.0.0.1:9697/rpc".to_string()
}

fn default_topic() -> String {
    "ipsec_driver".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            state_path: default_state_path(),
            netns_dir: default_netns_dir(),
            namespace_prefix: default_namespace_prefix(),
            root_helper: None,
        }
    }
}

impl Default for IpsecSettings {
    fn default() -> Self {
        Self {
            config_base_dir: None,
            status_check_interval: default_status_check_interval(),
            process_backend: ProcessBackendKind::default(),
        }
    }
}

impl Default for OpenswanSettings {
    fn default() -> Self {
        Self { binary: default_ipsec_binary() }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            endpoint: default_orchestrator_endpoint(),
            topic: default_topic(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn to_toml(&self) -> VpnResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Copy safe to print: credentials are masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(appliance) = config.appliance.as_mut() {
            appliance.password = REDACTED.to_string();
        }
        config
    }

    /// Reject settings that would make the driver unusable
    pub fn validate(&self) -> VpnResult<()> {
        if self.ipsec.status_check_interval == 0 {
            return Err(VpnError::ConfigError(
                "ipsec.status_check_interval must be at least 1 second".to_string(),
            ));
        }
        if let Some(appliance) = &self.appliance {
            if appliance.host.trim().is_empty() {
                return Err(VpnError::ConfigError("appliance.host cannot be empty".to_string()));
            }
            if appliance.timeout_secs == 0 {
                return Err(VpnError::ConfigError(
                    "appliance.timeout_secs must be at least 1 second".to_string(),
                ));
            }
        }
        url::Url::parse(&self.orchestrator.endpoint).map_err(|e| {
            VpnError::ConfigError(format!("Invalid orchestrator.endpoint: {}", e))
        })?;
        Ok(())
    }

    /// Directory holding one configuration tree per process
    pub fn config_base_dir(&self) -> PathBuf {
        self.ipsec
            .config_base_dir
            .clone()
            .unwrap_or_else(|| self.agent.state_path.join("ipsec"))
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> VpnResult<()> {
        for dir in [self.agent.state_path.clone(), self.config_base_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| VpnError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}
