//! Orchestrator data model
//!
//! Shapes of the VPN service definitions the orchestrator hands to the
//! driver. The driver keeps a working copy of one `VpnService` per
//! active process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status in the orchestrator's vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Down,
    Build,
    Error,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl Status {
    /// Whether the orchestrator's record is awaiting an update from the driver
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::PendingCreate | Status::PendingUpdate | Status::PendingDelete)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Active => "ACTIVE",
            Status::Down => "DOWN",
            Status::Build => "BUILD",
            Status::Error => "ERROR",
            Status::PendingCreate => "PENDING_CREATE",
            Status::PendingUpdate => "PENDING_UPDATE",
            Status::PendingDelete => "PENDING_DELETE",
        };
        f.write_str(s)
    }
}

/// Who may bring the tunnel up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Initiator {
    #[default]
    #[serde(rename = "bi-directional")]
    BiDirectional,
    #[serde(rename = "response-only")]
    ResponseOnly,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::BiDirectional => "bi-directional",
            Initiator::ResponseOnly => "response-only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    pub units: String,
    pub value: u64,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self { units: "seconds".to_string(), value: 3600 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IkePolicy {
    pub auth_algorithm: String,
    pub encryption_algorithm: String,
    pub pfs: String,
    pub ike_version: String,
    #[serde(default)]
    pub lifetime: Lifetime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpsecPolicy {
    pub transform_protocol: String,
    pub auth_algorithm: String,
    pub encryption_algorithm: String,
    pub pfs: String,
    #[serde(default = "default_encapsulation_mode")]
    pub encapsulation_mode: String,
    #[serde(default)]
    pub lifetime: Lifetime,
}

fn default_encapsulation_mode() -> String {
    "tunnel".to_string()
}

/// Dead peer detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dpd {
    pub action: String,
    pub interval: u32,
    pub timeout: u32,
}

impl Default for Dpd {
    fn default() -> Self {
        Self { action: "hold".to_string(), interval: 30, timeout: 120 }
    }
}

/// One tunnel of a VPN service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConnection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub peer_address: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub peer_cidrs: Vec<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub psk: String,
    #[serde(default)]
    pub initiator: Initiator,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    pub status: Status,
    #[serde(default)]
    pub dpd: Dpd,
    pub ikepolicy: IkePolicy,
    pub ipsecpolicy: IpsecPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: String,
}

/// Full definition of one VPN service as held by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnService {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub router_id: String,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    pub status: Status,
    #[serde(default)]
    pub external_ip: String,
    pub subnet: Subnet,
    #[serde(default)]
    pub ipsec_site_connections: Vec<SiteConnection>,
}

fn default_mtu() -> u32 {
    1500
}

fn default_true() -> bool {
    true
}
