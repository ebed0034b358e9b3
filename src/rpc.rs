//! Orchestrator messaging
//!
//! Inbound requests arrive as [`DriverRequest`] envelopes; outbound calls go
//! through [`OrchestratorApi`]. Every outbound message carries the protocol
//! version so the orchestrator can reject incompatible drivers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::OrchestratorSettings;
use crate::error::{VpnError, VpnResult};
use crate::model::{Status, VpnService};
use crate::process::ConnectionStatusMap;

/// Driver API version spoken with the orchestrator
pub const PLUGIN_VERSION: &str = "1.0";

/// Status of one service as sent upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    /// VPN service id
    pub id: String,
    pub status: Status,
    pub updated_pending_status: bool,
    pub ipsec_site_connections: ConnectionStatusMap,
}

/// Calls the driver makes to the orchestrator
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Services whose routers are hosted here
    async fn get_vpn_services_on_host(&self, host: &str) -> VpnResult<Vec<VpnService>>;

    /// One-way status batch
    async fn update_status(&self, status: &[ServiceStatusReport]) -> VpnResult<()>;
}

/// Requests the orchestrator sends to the driver; none has a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum DriverRequest {
    CreateIpsecSiteConnection { conn_info: Value },
    DeleteIpsecSiteConnection { conn_info: Value },
    VpnserviceUpdated,
    CreateRouter { process_id: String },
    DestroyRouter { process_id: String },
}

impl DriverRequest {
    pub fn method(&self) -> &'static str {
        match self {
            DriverRequest::CreateIpsecSiteConnection { .. } => "create_ipsec_site_connection",
            DriverRequest::DeleteIpsecSiteConnection { .. } => "delete_ipsec_site_connection",
            DriverRequest::VpnserviceUpdated => "vpnservice_updated",
            DriverRequest::CreateRouter { .. } => "create_router",
            DriverRequest::DestroyRouter { .. } => "destroy_router",
        }
    }
}

#[derive(Serialize)]
struct RpcMessage<'a> {
    method: &'a str,
    args: Value,
    version: &'a str,
}

/// JSON over HTTP: `POST <endpoint>/<topic>` with `{method, args, version}`
pub struct HttpOrchestratorClient {
    http: reqwest::Client,
    url: Url,
}

impl HttpOrchestratorClient {
    pub fn new(settings: &OrchestratorSettings) -> VpnResult<Self> {
        let url = Url::parse(&format!(
            "{}/{}",
            settings.endpoint.trim_end_matches('/'),
            settings.topic
        ))
        .map_err(|e| VpnError::ConfigError(format!("Invalid orchestrator endpoint: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call(&self, method: &str, args: Value) -> VpnResult<reqwest::Response> {
        let message = RpcMessage { method, args, version: PLUGIN_VERSION };
        debug!("RPC {} -> {}", method, self.url);

        let resp = self.http.post(self.url.clone()).json(&message).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VpnError::Rpc(format!("{} failed (HTTP {}): {}", method, status.as_u16(), body)));
        }
        Ok(resp)
    }
}

#[async_trait]
impl OrchestratorApi for HttpOrchestratorClient {
    async fn get_vpn_services_on_host(&self, host: &str) -> VpnResult<Vec<VpnService>> {
        let resp = self.call("get_vpn_services_on_host", json!({ "host": host })).await?;
        let services = resp
            .json::<Vec<VpnService>>()
            .await
            .map_err(|e| VpnError::Rpc(format!("Malformed service list: {}", e)))?;
        Ok(services)
    }

    async fn update_status(&self, status: &[ServiceStatusReport]) -> VpnResult<()> {
        self.call("update_status", json!({ "status": status })).await?;
        Ok(())
    }
}
