//! Local IPsec process supervision
//!
//! One [`VpnProcess`] per router drives a keying daemon inside the router's
//! network namespace:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  VpnProcess (status, pending flags)  │
//! └──────────────┬───────────────────────┘
//!                │ ProcessContext
//!                ▼
//!        ┌──────────────┐      ┌──────────────┐
//!        │ SwanBackend  │─────▶│ConfigRenderer│
//!        └──────┬───────┘      └──────────────┘
//!               │ CommandRunner
//!               ▼
//!     ip netns exec <ns> ipsec ...
//! ```
//!
//! The process state is polled, not event driven: `active()` asks the
//! daemon for its status every time and folds the answer into the
//! per-connection map.

pub mod backend;
pub mod common;
pub mod openswan;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::{AgentConfig, ProcessBackendKind};
use crate::error::VpnResult;
use crate::exec::CommandRunner;
use crate::model::{Status, VpnService};
use crate::renderer::ConfigRenderer;

pub use backend::{ProcessContext, SwanBackend};
pub use openswan::OpenSwanBackend;
pub use status::{ConnectionStatus, ConnectionStatusMap};

/// Supervisory handle for one local keying daemon
pub struct VpnProcess {
    id: String,
    namespace: Option<String>,
    config_dir: PathBuf,
    vpnservice: Option<VpnService>,
    connection_status: ConnectionStatusMap,
    updated_pending_status: bool,
    backend: Arc<dyn SwanBackend>,
}

impl VpnProcess {
    pub fn new(
        id: &str,
        vpnservice: Option<VpnService>,
        namespace: Option<String>,
        config_dir: PathBuf,
        backend: Arc<dyn SwanBackend>,
    ) -> Self {
        Self {
            id: id.to_string(),
            namespace,
            config_dir,
            vpnservice,
            connection_status: ConnectionStatusMap::new(),
            updated_pending_status: false,
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace(&mut self, namespace: Option<String>) {
        self.namespace = namespace;
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }

    pub fn vpnservice(&self) -> Option<&VpnService> {
        self.vpnservice.as_ref()
    }

    pub fn set_vpnservice(&mut self, vpnservice: VpnService) {
        self.vpnservice = Some(vpnservice);
    }

    pub fn connection_status(&self) -> &ConnectionStatusMap {
        &self.connection_status
    }

    pub fn updated_pending_status(&self) -> bool {
        self.updated_pending_status
    }

    /// Clear the process flag and every connection flag after a report went out
    pub fn unset_updated_pending_status(&mut self) {
        self.updated_pending_status = false;
        for conn in self.connection_status.values_mut() {
            conn.updated_pending_status = false;
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn context(&self) -> ProcessContext<'_> {
        ProcessContext {
            id: &self.id,
            namespace: self.namespace.as_deref(),
            config_dir: &self.config_dir,
            service: self.vpnservice.as_ref(),
            known_connections: self.connection_status.keys().map(String::as_str).collect(),
        }
    }

    /// Poll the daemon; a failed status query means the daemon is down
    pub async fn active(&mut self) -> bool {
        if self.namespace.is_none() {
            self.mark_connections_down();
            return false;
        }
        let output = {
            let ctx = self.context();
            self.backend.get_status(&ctx).await
        };
        match output {
            Ok(output) => {
                status::update_connection_status(&mut self.connection_status, &output);
                true
            }
            Err(e) => {
                debug!("Process {} not active: {}", self.id, e);
                self.mark_connections_down();
                false
            }
        }
    }

    /// Without a running daemon no tracked connection can be up
    fn mark_connections_down(&mut self) {
        for conn in self.connection_status.values_mut() {
            conn.status = Some(Status::Down);
        }
    }

    pub async fn status(&mut self) -> Status {
        if self.active().await {
            Status::Active
        } else {
            Status::Down
        }
    }

    /// Regenerate the configuration tree from the cached service
    pub async fn ensure_configs(&self) -> VpnResult<()> {
        self.backend.ensure_configs(&self.context()).await
    }

    pub async fn remove_config(&self) {
        common::remove_config_tree(&self.config_dir).await;
    }

    /// Render configuration and (re)start the daemon; failures are logged only.
    ///
    /// Configuration is rendered even without a namespace; only the daemon
    /// start is skipped until the router is bound.
    pub async fn enable(&mut self) {
        if let Err(e) = self.try_enable().await {
            error!("Failed to enable vpn process on router {}: {}", self.id, e);
        }
    }

    async fn try_enable(&mut self) -> VpnResult<()> {
        self.ensure_configs().await?;
        let running = self.active().await;
        let ctx = self.context();
        if running {
            info!("Restarting vpn process on router {}", self.id);
            self.backend.restart(&ctx).await
        } else {
            self.backend.start(&ctx).await
        }
    }

    /// Stop the daemon if running and drop the configuration tree.
    ///
    /// The tree is removed even when stopping fails.
    pub async fn disable(&mut self) {
        if self.active().await {
            let ctx = self.context();
            match self.backend.stop(&ctx).await {
                Ok(()) => self.mark_connections_down(),
                Err(e) => error!("Failed to disable vpn process on router {}: {}", self.id, e),
            }
        }
        self.remove_config().await;
    }

    /// Apply the cached service: admin state, aggregate status and the
    /// pending flags of every entity the orchestrator is waiting on
    pub async fn update(&mut self) {
        let admin_up = match &self.vpnservice {
            Some(service) => service.admin_state_up,
            None => {
                debug!("Process {} has no vpn service to apply", self.id);
                return;
            }
        };

        if admin_up {
            self.enable().await;
        } else {
            self.disable().await;
        }

        let status = self.status().await;
        let Some(service) = self.vpnservice.as_mut() else {
            return;
        };

        if service.status.is_pending() {
            self.updated_pending_status = true;
        }
        service.status = status;

        for conn in service.ipsec_site_connections.iter_mut().filter(|c| c.status.is_pending()) {
            let Some(tracked) = self.connection_status.get_mut(&conn.id) else {
                continue;
            };
            tracked.updated_pending_status = true;
            if let Some(current) = tracked.status {
                conn.status = current;
            }
        }
    }
}

/// Builds processes with the backend selected in configuration
pub struct ProcessFactory {
    kind: ProcessBackendKind,
    config_base_dir: PathBuf,
    backend: Arc<dyn SwanBackend>,
}

impl ProcessFactory {
    pub fn new(
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
        renderer: Arc<dyn ConfigRenderer>,
    ) -> Self {
        let kind = config.ipsec.process_backend;
        let backend: Arc<dyn SwanBackend> = match kind {
            ProcessBackendKind::Openswan => {
                Arc::new(OpenSwanBackend::new(&config.openswan.binary, runner, renderer))
            }
        };
        Self {
            kind,
            config_base_dir: config.config_base_dir(),
            backend,
        }
    }

    pub fn kind(&self) -> ProcessBackendKind {
        self.kind
    }

    pub fn create(&self, id: &str, vpnservice: Option<VpnService>, namespace: Option<String>) -> VpnProcess {
        debug!("Creating {} process for router {}", self.backend.name(), id);
        VpnProcess::new(
            id,
            vpnservice,
            namespace,
            self.config_base_dir.join(id),
            self.backend.clone(),
        )
    }
}
