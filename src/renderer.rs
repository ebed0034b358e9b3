//! Keying daemon configuration rendering
//!
//! The renderer is an explicitly constructed service handed to each
//! process; processes never reach for a shared global engine.

use crate::error::VpnResult;
use crate::model::{SiteConnection, VpnService};

/// Generated files of a process configuration tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    IpsecConf,
    IpsecSecrets,
}

impl ConfigKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ConfigKind::IpsecConf => "ipsec.conf",
            ConfigKind::IpsecSecrets => "ipsec.secrets",
        }
    }

    /// Secrets must not be world readable
    pub fn mode(&self) -> u32 {
        match self {
            ConfigKind::IpsecConf => 0o644,
            ConfigKind::IpsecSecrets => 0o600,
        }
    }
}

/// Turns a service description into configuration text
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, kind: ConfigKind, service: &VpnService) -> VpnResult<String>;
}

/// Openswan vocabulary; values without an entry pass through unchanged
pub fn swan_dialect(value: &str) -> &str {
    match value {
        "3des" => "3des",
        "aes-128" => "aes128",
        "aes-256" => "aes256",
        "aes-192" => "aes192",
        "group2" => "modp1024",
        "group5" => "modp1536",
        "group14" => "modp2048",
        "group15" => "modp3072",
        "bi-directional" => "start",
        "response-only" => "add",
        "v2" => "insist",
        "v1" => "never",
        other => other,
    }
}

/// Renders openswan `ipsec.conf` / `ipsec.secrets`
#[derive(Debug, Default, Clone)]
pub struct SwanConfigRenderer;

impl SwanConfigRenderer {
    pub fn new() -> Self {
        Self
    }

    fn build_ipsec_conf(&self, service: &VpnService) -> String {
        let mut conf = String::new();

        conf.push_str(&format!("# Configuration for {}\n", service.name));
        conf.push_str("config setup\n");
        conf.push_str("    nat_traversal=yes\n");
        conf.push_str(&format!("    listen={}\n", service.external_ip));
        conf.push_str("conn %default\n");
        conf.push_str("    ikelifetime=480m\n");
        conf.push_str("    keylife=60m\n");
        conf.push_str("    keyingtries=%forever\n");

        for conn in service.ipsec_site_connections.iter().filter(|c| c.admin_state_up) {
            self.push_conn(&mut conf, service, conn);
        }

        conf
    }

    fn push_conn(&self, conf: &mut String, service: &VpnService, conn: &SiteConnection) {
        let ike = &conn.ikepolicy;
        let esp = &conn.ipsecpolicy;

        conf.push_str(&format!("conn {}\n", conn.id));

        // Local side
        conf.push_str(&format!("    left={}\n", service.external_ip));
        conf.push_str(&format!("    leftid={}\n", service.external_ip));
        conf.push_str(&format!("    auto={}\n", swan_dialect(conn.initiator.as_str())));
        conf.push_str(&format!("    leftsubnet={}\n", service.subnet.cidr));
        conf.push_str("    leftnexthop=%defaultroute\n");

        // Remote side
        conf.push_str(&format!("    right={}\n", conn.peer_address));
        conf.push_str(&format!("    rightid={}\n", conn.peer_id));
        conf.push_str(&format!("    rightsubnets={{ {} }}\n", conn.peer_cidrs.join(" ")));
        conf.push_str("    rightnexthop=%defaultroute\n");

        conf.push_str(&format!("    dpdaction={}\n", conn.dpd.action));
        conf.push_str(&format!("    dpddelay={}\n", conn.dpd.interval));
        conf.push_str(&format!("    dpdtimeout={}\n", conn.dpd.timeout));
        conf.push_str("    authby=secret\n");

        // IKE policy
        conf.push_str(&format!("    ikev2={}\n", swan_dialect(&ike.ike_version)));
        conf.push_str(&format!(
            "    ike={}-{};{}\n",
            swan_dialect(&ike.encryption_algorithm),
            swan_dialect(&ike.auth_algorithm),
            swan_dialect(&ike.pfs)
        ));
        conf.push_str(&format!("    ikelifetime={}s\n", ike.lifetime.value));

        // IPsec policy
        conf.push_str(&format!("    auth={}\n", esp.transform_protocol));
        conf.push_str(&format!(
            "    phase2alg={}-{};{}\n",
            swan_dialect(&esp.encryption_algorithm),
            swan_dialect(&esp.auth_algorithm),
            swan_dialect(&esp.pfs)
        ));
        conf.push_str(&format!("    type={}\n", esp.encapsulation_mode));
        conf.push_str(&format!("    lifetime={}s\n", esp.lifetime.value));
    }

    fn build_ipsec_secrets(&self, service: &VpnService) -> String {
        let mut secrets = String::new();

        for conn in &service.ipsec_site_connections {
            secrets.push_str(&format!(
                "{} {} : PSK \"{}\"\n",
                service.external_ip, conn.peer_id, conn.psk
            ));
        }

        secrets
    }
}

impl ConfigRenderer for SwanConfigRenderer {
    fn render(&self, kind: ConfigKind, service: &VpnService) -> VpnResult<String> {
        Ok(match kind {
            ConfigKind::IpsecConf => self.build_ipsec_conf(service),
            ConfigKind::IpsecSecrets => self.build_ipsec_secrets(service),
        })
    }
}
