//! IPsec device driver
//!
//! Binds the orchestrator's request contract to the two backends: the
//! remote appliance ([`Provisioner`]) when one is configured, and local
//! keying daemons ([`VpnProcess`]) otherwise. Every request is
//! fire-and-forget; failures are logged and the periodic status report is
//! how the orchestrator learns the outcome.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::{NetnsRouterAgent, RouterAgent};
use crate::appliance::ApplianceClient;
use crate::config::AgentConfig;
use crate::error::VpnResult;
use crate::exec::{CommandRunner, NetnsRunner};
use crate::model::VpnService;
use crate::process::{ProcessFactory, VpnProcess};
use crate::provisioner::Provisioner;
use crate::reconciler::StatusReconciler;
use crate::renderer::SwanConfigRenderer;
use crate::rpc::{DriverRequest, HttpOrchestratorClient, OrchestratorApi};

const NAT_CHAIN: &str = "POSTROUTING";

/// Mutable driver state; one lock guards the process map and the snapshots
#[derive(Default)]
struct DriverState {
    processes: HashMap<String, VpnProcess>,
    reconciler: StatusReconciler,
}

pub struct IpsecDriver {
    host: String,
    agent: Arc<dyn RouterAgent>,
    orchestrator: Arc<dyn OrchestratorApi>,
    factory: ProcessFactory,
    provisioner: Option<Provisioner>,
    state: Mutex<DriverState>,
    /// At most one sync pass runs at a time
    sync_lock: Mutex<()>,
}

impl IpsecDriver {
    pub fn new(
        host: &str,
        agent: Arc<dyn RouterAgent>,
        orchestrator: Arc<dyn OrchestratorApi>,
        factory: ProcessFactory,
        provisioner: Option<Provisioner>,
    ) -> Self {
        Self {
            host: host.to_string(),
            agent,
            orchestrator,
            factory,
            provisioner,
            state: Mutex::new(DriverState::default()),
            sync_lock: Mutex::new(()),
        }
    }

    /// Wire up the production collaborators described by `config`
    pub fn from_config(config: &AgentConfig) -> VpnResult<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(NetnsRunner::new(config.agent.root_helper.as_deref()));
        let factory = ProcessFactory::new(config, runner.clone(), Arc::new(SwanConfigRenderer::new()));
        let agent = Arc::new(NetnsRouterAgent::new(config, runner));
        let orchestrator = Arc::new(HttpOrchestratorClient::new(&config.orchestrator)?);

        let provisioner = match &config.appliance {
            Some(settings) => {
                info!("Provisioning site connections on appliance {}", settings.host);
                let client = ApplianceClient::new(settings)?;
                Some(Provisioner::new(Arc::new(client), &settings.local_interface))
            }
            None => None,
        };

        Ok(Self::new(&config.agent.host, agent, orchestrator, factory, provisioner))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn provisioner(&self) -> Option<&Provisioner> {
        self.provisioner.as_ref()
    }

    /// Ids of the processes currently supervised
    pub async fn process_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.processes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route one inbound request; errors are logged, never returned
    pub async fn dispatch(&self, request: DriverRequest) {
        debug!("Dispatching {}", request.method());
        match request {
            DriverRequest::CreateIpsecSiteConnection { conn_info } => {
                self.create_ipsec_site_connection(&conn_info).await
            }
            DriverRequest::DeleteIpsecSiteConnection { conn_info } => {
                self.delete_ipsec_site_connection(&conn_info).await
            }
            DriverRequest::VpnserviceUpdated => self.vpnservice_updated().await,
            DriverRequest::CreateRouter { process_id } => self.create_router(&process_id).await,
            DriverRequest::DestroyRouter { process_id } => self.destroy_router(&process_id).await,
        }
    }

    pub async fn create_ipsec_site_connection(&self, conn_info: &Value) {
        match &self.provisioner {
            // The provisioner logs the cause of any failure
            Some(provisioner) => {
                let _ = provisioner.create_site_connection(conn_info).await;
            }
            None => self.sync_logged(&[]).await,
        }
    }

    pub async fn delete_ipsec_site_connection(&self, conn_info: &Value) {
        match &self.provisioner {
            Some(provisioner) => {
                if let Err(e) = provisioner.delete_site_connection(conn_info).await {
                    error!("Rejected delete request: {}", e);
                }
            }
            None => self.sync_logged(&[]).await,
        }
    }

    pub async fn vpnservice_updated(&self) {
        self.sync_logged(&[]).await;
    }

    /// The router namespace is ready: bind and start its process
    pub async fn create_router(&self, process_id: &str) {
        let mut guard = self.state.lock().await;
        let Some(process) = guard.processes.get_mut(process_id) else {
            debug!("No vpn process for router {}", process_id);
            return;
        };

        if process.namespace().is_none() {
            process.set_namespace(self.agent.get_namespace(process_id).await);
        }
        if let Some(service) = process.vpnservice().cloned() {
            self.update_nat(&service, true).await;
        }
        process.enable().await;
    }

    /// The router namespace is going away: stop and forget its process
    pub async fn destroy_router(&self, process_id: &str) {
        let mut guard = self.state.lock().await;
        self.destroy_router_locked(&mut guard, process_id).await;
    }

    /// Reconcile local processes with the orchestrator's view of this host.
    ///
    /// `routers` lists routers created in the triggering event; those
    /// without a service lose their process.
    pub async fn sync(&self, routers: &[String]) -> VpnResult<()> {
        let _sync = self.sync_lock.lock().await;

        let services = self.orchestrator.get_vpn_services_on_host(&self.host).await?;
        let router_ids: HashSet<String> = services.iter().map(|s| s.router_id.clone()).collect();
        debug!("Syncing {} vpn services on {}", services.len(), self.host);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        for service in services {
            self.update_nat(&service, true).await;
            let router_id = service.router_id.clone();
            let process = self.ensure_process(state, &router_id, Some(service)).await;
            process.update().await;
        }

        for router_id in routers.iter().filter(|r| !router_ids.contains(*r)) {
            self.ensure_process(state, router_id, None).await;
            self.destroy_router_locked(state, router_id).await;
        }

        let orphans: Vec<String> = state
            .processes
            .keys()
            .filter(|id| !router_ids.contains(*id))
            .cloned()
            .collect();
        for process_id in orphans {
            self.destroy_router_locked(state, &process_id).await;
        }

        self.report_locked(state).await
    }

    /// Send the status of every process that changed since the last report
    pub async fn report_status(&self) -> VpnResult<()> {
        let mut guard = self.state.lock().await;
        self.report_locked(&mut guard).await
    }

    async fn sync_logged(&self, routers: &[String]) {
        if let Err(e) = self.sync(routers).await {
            error!("Sync with orchestrator failed: {}", e);
        }
    }

    /// Create the process if absent or still unbound; otherwise refresh its service copy
    async fn ensure_process<'a>(
        &self,
        state: &'a mut DriverState,
        process_id: &str,
        service: Option<VpnService>,
    ) -> &'a mut VpnProcess {
        let rebuild = state
            .processes
            .get(process_id)
            .map_or(true, |p| p.namespace().is_none());

        if rebuild {
            let namespace = self.agent.get_namespace(process_id).await;
            let process = self.factory.create(process_id, service, namespace);
            state.processes.insert(process_id.to_string(), process);
        } else if let (Some(process), Some(service)) = (state.processes.get_mut(process_id), service) {
            process.set_vpnservice(service);
        }

        state
            .processes
            .entry(process_id.to_string())
            .or_insert_with(|| self.factory.create(process_id, None, None))
    }

    async fn destroy_router_locked(&self, state: &mut DriverState, process_id: &str) {
        let Some(mut process) = state.processes.remove(process_id) else {
            return;
        };
        info!("Destroying vpn process for router {}", process_id);
        process.disable().await;
        if let Some(service) = process.vpnservice() {
            self.update_nat(service, false).await;
        }
        state.reconciler.forget(process_id);
    }

    async fn report_locked(&self, state: &mut DriverState) -> VpnResult<()> {
        let pending = state.reconciler.collect(&mut state.processes).await;
        if pending.is_empty() {
            return Ok(());
        }

        info!("Reporting status of {} vpn services", pending.reports.len());
        match self.orchestrator.update_status(&pending.reports).await {
            Ok(()) => {
                state.reconciler.commit(pending, &mut state.processes);
                Ok(())
            }
            Err(e) => {
                warn!("Status report failed, will retry: {}", e);
                Err(e)
            }
        }
    }

    /// Exempt tunnel traffic from SNAT for every (local subnet, peer CIDR) pair
    async fn update_nat(&self, service: &VpnService, add: bool) {
        let local_cidr = &service.subnet.cidr;
        for conn in &service.ipsec_site_connections {
            for peer_cidr in &conn.peer_cidrs {
                let rule = nat_rule(local_cidr, peer_cidr);
                if add {
                    self.agent.add_nat_rule(&service.router_id, NAT_CHAIN, &rule, true).await;
                } else {
                    self.agent.remove_nat_rule(&service.router_id, NAT_CHAIN, &rule, true).await;
                }
            }
        }
        if let Err(e) = self.agent.iptables_apply(&service.router_id).await {
            error!("Failed to apply NAT rules on router {}: {}", service.router_id, e);
        }
    }
}

pub fn nat_rule(local_cidr: &str, peer_cidr: &str) -> String {
    format!(
        "-s {} -d {} -m policy --dir out --pol ipsec -j ACCEPT",
        local_cidr, peer_cidr
    )
}
