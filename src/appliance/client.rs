//! Appliance REST client
//!
//! Token based session on top of `reqwest::Client`. A token is requested
//! lazily from `auth/token-services` with basic auth and sent as
//! `X-Auth-Token`; an expired token (401) is renewed once per request.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::ApplianceSettings;
use crate::error::{VpnError, VpnResult};
use super::{ApplianceApi, ApplianceResource};

const TOKEN_PATH: &str = "auth/token-services";
const TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "token-id")]
    token_id: String,
}

pub struct ApplianceClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl ApplianceClient {
    /// Client for `https://<host>:<port>/api/v1/`
    pub fn new(settings: &ApplianceSettings) -> VpnResult<Self> {
        let base_url = Url::parse(&format!("https://{}:{}/api/v1/", settings.host, settings.port))
            .map_err(|e| VpnError::ConfigError(format!("Invalid appliance address: {}", e)))?;
        Self::with_base_url(base_url, settings)
    }

    /// Client for an explicit API root; the root must end with `/`
    pub fn with_base_url(base_url: Url, settings: &ApplianceSettings) -> VpnResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        Ok(Self {
            http,
            base_url,
            username: settings.username.clone(),
            password: settings.password.clone(),
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> VpnResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| VpnError::ConfigError(format!("Invalid appliance URL for '{}': {}", path, e)))
    }

    /// Request a fresh token and cache it
    pub async fn authenticate(&self) -> VpnResult<String> {
        let url = self.url(TOKEN_PATH)?;
        debug!("Requesting appliance token from {}", url);

        let resp = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::CREATED {
            return Err(VpnError::ServiceError(format!(
                "Appliance authentication failed (HTTP {})",
                status.as_u16()
            )));
        }

        let body: TokenResponse = resp.json().await?;
        *self.token.write().await = Some(body.token_id.clone());
        debug!("Appliance token obtained");
        Ok(body.token_id)
    }

    async fn token(&self) -> VpnResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.authenticate().await
    }

    async fn send_once(&self, method: &Method, url: &Url, body: Option<&Value>, token: &str) -> VpnResult<StatusCode> {
        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .header(TOKEN_HEADER, token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?.status())
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> VpnResult<u16> {
        let url = self.url(path)?;
        trace!("{} {}", method, url);

        let token = self.token().await?;
        let mut status = self.send_once(&method, &url, body, &token).await?;

        if status == StatusCode::UNAUTHORIZED {
            warn!("Appliance token rejected, re-authenticating");
            *self.token.write().await = None;
            let token = self.authenticate().await?;
            status = self.send_once(&method, &url, body, &token).await?;
        }

        debug!("{} {} -> {}", method, url, status.as_u16());
        Ok(status.as_u16())
    }
}

#[async_trait]
impl ApplianceApi for ApplianceClient {
    async fn create(&self, resource: ApplianceResource, payload: &Value) -> VpnResult<u16> {
        self.send(Method::POST, resource.endpoint(), Some(payload)).await
    }

    async fn delete(&self, resource: ApplianceResource, resource_id: &str) -> VpnResult<u16> {
        let path = format!("{}/{}", resource.endpoint(), resource_id);
        self.send(Method::DELETE, &path, None).await
    }
}
