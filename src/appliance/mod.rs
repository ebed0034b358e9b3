//! Remote router appliance access
//!
//! The appliance exposes single-resource CRUD over REST and nothing more:
//! no transactions spanning resources. Callers see only the call contract
//! in [`ApplianceApi`]; [`ApplianceClient`] is the HTTP implementation.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::error::VpnResult;

pub use client::ApplianceClient;

/// Resource kinds the provisioner creates, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplianceResource {
    PreSharedKey,
    IkePolicy,
    IpsecPolicy,
    IpsecConnection,
    StaticRoute,
}

impl ApplianceResource {
    /// Collection path relative to the API root
    pub fn endpoint(&self) -> &'static str {
        match self {
            ApplianceResource::PreSharedKey => "vpn-svc/ike/keyrings",
            ApplianceResource::IkePolicy => "vpn-svc/ike/policies",
            ApplianceResource::IpsecPolicy => "vpn-svc/ipsec/policies",
            ApplianceResource::IpsecConnection => "vpn-svc/site-to-site",
            ApplianceResource::StaticRoute => "routing-svc/static-routes",
        }
    }

    /// Human readable name used in logs and errors
    pub fn title(&self) -> &'static str {
        match self {
            ApplianceResource::PreSharedKey => "Pre-Shared Key",
            ApplianceResource::IkePolicy => "IKE Policy",
            ApplianceResource::IpsecPolicy => "IPSec Policy",
            ApplianceResource::IpsecConnection => "IPSec Connection",
            ApplianceResource::StaticRoute => "Static Route",
        }
    }
}

impl fmt::Display for ApplianceResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Call contract of the appliance.
///
/// Both operations return the HTTP status code; interpreting it is up to
/// the caller. `Err` means the request never produced a response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApplianceApi: Send + Sync {
    async fn create(&self, resource: ApplianceResource, payload: &Value) -> VpnResult<u16>;

    async fn delete(&self, resource: ApplianceResource, resource_id: &str) -> VpnResult<u16>;
}

/// Static route id: `10.1.0.0/24` on `Tunnel0` becomes `10.1.0.0_24_Tunnel0`
pub fn make_route_id(cidr: &str, site_conn_id: &str) -> String {
    format!("{}_{}", cidr.replace('/', "_"), site_conn_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_route_id() {
        assert_eq!(make_route_id("10.1.0.0/24", "Tunnel0"), "10.1.0.0_24_Tunnel0");
        assert_eq!(make_route_id("2001:db8::/64", "Tunnel5"), "2001:db8::_64_Tunnel5");
    }

    #[test]
    fn test_endpoints_are_relative() {
        for resource in [
            ApplianceResource::PreSharedKey,
            ApplianceResource::IkePolicy,
            ApplianceResource::IpsecPolicy,
            ApplianceResource::IpsecConnection,
            ApplianceResource::StaticRoute,
        ] {
            assert!(!resource.endpoint().starts_with('/'));
            assert!(!resource.endpoint().ends_with('/'));
        }
    }
}
