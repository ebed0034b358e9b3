//! vpnctl - IPsec site-to-site VPN device driver
//!
//! Provisions and supervises IPsec tunnels on behalf of a network
//! orchestrator:
//! - Local keying daemons (openswan) per router namespace
//! - Remote router appliance configuration with transactional rollback
//! - Policy dialect translation and validation
//! - Periodic status reconciliation with the orchestrator

pub mod error;
pub mod config;
pub mod model;
pub mod dialect;
pub mod exec;
pub mod renderer;
pub mod process;
pub mod appliance;
pub mod provisioner;
pub mod reconciler;
pub mod agent;
pub mod rpc;
pub mod driver;

// Re-export commonly used types
pub use error::{VpnError, VpnResult};
pub use config::AgentConfig;
pub use model::{IkePolicy, IpsecPolicy, SiteConnection, Status, VpnService};
pub use dialect::PolicyKind;
pub use process::{ProcessFactory, SwanBackend, VpnProcess};
pub use appliance::{ApplianceApi, ApplianceClient, ApplianceResource};
pub use provisioner::{Provisioner, RollbackStep};
pub use reconciler::{StatusReconciler, StatusSnapshot};
pub use agent::{NetnsRouterAgent, RouterAgent};
pub use rpc::{DriverRequest, HttpOrchestratorClient, OrchestratorApi, ServiceStatusReport, PLUGIN_VERSION};
pub use driver::IpsecDriver;
