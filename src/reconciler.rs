//! Status reconciliation
//!
//! A pass polls every process, compares it with the snapshot taken at the
//! last successful report and batches only the services that changed.
//! Reporting is two-phase: [`StatusReconciler::collect`] builds the batch
//! without touching any state, and [`StatusReconciler::commit`] clears the
//! pending flags and replaces snapshots once the batch was accepted
//! upstream. A failed report leaves everything as it was, so the same
//! changes go out on the next pass.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::model::Status;
use crate::process::{ConnectionStatusMap, VpnProcess};
use crate::rpc::ServiceStatusReport;

/// What was last reported for one process; pending flags are not part of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: Status,
    pub connections: BTreeMap<String, Option<Status>>,
}

impl StatusSnapshot {
    fn capture(status: Status, connections: &ConnectionStatusMap) -> Self {
        Self {
            status,
            connections: connections.iter().map(|(id, c)| (id.clone(), c.status)).collect(),
        }
    }
}

/// Batch produced by [`StatusReconciler::collect`], not yet applied
#[derive(Debug, Default)]
pub struct PendingReport {
    pub reports: Vec<ServiceStatusReport>,
    snapshots: Vec<(String, StatusSnapshot)>,
}

impl PendingReport {
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StatusReconciler {
    snapshots: HashMap<String, StatusSnapshot>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported snapshot of a process
    pub fn snapshot(&self, process_id: &str) -> Option<&StatusSnapshot> {
        self.snapshots.get(process_id)
    }

    /// Poll every process and gather the ones that changed since the last report
    pub async fn collect(&self, processes: &mut HashMap<String, VpnProcess>) -> PendingReport {
        let mut ids: Vec<String> = processes.keys().cloned().collect();
        ids.sort();

        let mut pending = PendingReport::default();
        for id in ids {
            let Some(process) = processes.get_mut(&id) else {
                continue;
            };
            let Some(service_id) = process.vpnservice().map(|s| s.id.clone()) else {
                continue;
            };

            let status = process.status().await;
            let current = StatusSnapshot::capture(status, process.connection_status());
            let flagged = process.updated_pending_status()
                || process.connection_status().values().any(|c| c.updated_pending_status);

            if !flagged && self.snapshots.get(&id) == Some(&current) {
                continue;
            }

            debug!("Status of process {} changed", id);
            pending.reports.push(ServiceStatusReport {
                id: service_id,
                status,
                updated_pending_status: process.updated_pending_status(),
                ipsec_site_connections: process.connection_status().clone(),
            });
            pending.snapshots.push((id, current));
        }
        pending
    }

    /// Apply a batch the orchestrator accepted
    pub fn commit(&mut self, pending: PendingReport, processes: &mut HashMap<String, VpnProcess>) {
        for (id, snapshot) in pending.snapshots {
            if let Some(process) = processes.get_mut(&id) {
                process.unset_updated_pending_status();
            }
            self.snapshots.insert(id, snapshot);
        }
    }

    /// Drop the snapshot of a destroyed process
    pub fn forget(&mut self, process_id: &str) {
        self.snapshots.remove(process_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::exec::testing::RecordingRunner;
    use crate::model::fixtures::{site_connection, vpn_service};
    use crate::process::ProcessFactory;
    use crate::renderer::SwanConfigRenderer;
    use std::path::Path;
    use std::sync::Arc;

    const BOTH_UP: &str = "000 \"conn-1/0x1\": x; erouted;\n000 \"conn-2/0x1\": x; erouted;\n";

    fn factory(base: &Path, runner: Arc<RecordingRunner>) -> ProcessFactory {
        let mut config = AgentConfig::default();
        config.ipsec.config_base_dir = Some(base.to_path_buf());
        ProcessFactory::new(&config, runner, Arc::new(SwanConfigRenderer::new()))
    }

    fn processes(base: &Path, runner: Arc<RecordingRunner>, routers: &[&str]) -> HashMap<String, VpnProcess> {
        let factory = factory(base, runner);
        routers
            .iter()
            .map(|r| {
                let service = vpn_service(r, vec![site_connection("conn-1", "172.24.4.20", &["10.1.0.0/24"])]);
                let ns = format!("qrouter-{}", r);
                (r.to_string(), factory.create(r, Some(service), Some(ns)))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_pass_reports_everything() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner, &["r1", "r2"]);
        let reconciler = StatusReconciler::new();

        let pending = reconciler.collect(&mut procs).await;
        let ids: Vec<_> = pending.reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["svc-r1", "svc-r2"]);
        assert_eq!(pending.reports[0].status, Status::Active);
    }

    #[tokio::test]
    async fn test_no_change_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner, &["r1"]);
        let mut reconciler = StatusReconciler::new();

        let pending = reconciler.collect(&mut procs).await;
        reconciler.commit(pending, &mut procs);

        assert!(reconciler.collect(&mut procs).await.is_empty());
        assert!(reconciler.snapshot("r1").is_some());
    }

    #[tokio::test]
    async fn test_only_changed_subset_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner.clone(), &["r1", "r2"]);
        let mut reconciler = StatusReconciler::new();
        let pending = reconciler.collect(&mut procs).await;
        reconciler.commit(pending, &mut procs);

        // conn-2 drops on r2 only
        runner.respond(
            &format!("ipsec whack --ctlbase {}/r2/", dir.path().display()),
            "000 \"conn-1/0x1\": x; erouted;\n000 \"conn-2/0x1\": x; unrouted;\n",
        );

        let pending = reconciler.collect(&mut procs).await;
        assert_eq!(pending.reports.len(), 1);
        assert_eq!(pending.reports[0].id, "svc-r2");
        assert_eq!(pending.reports[0].ipsec_site_connections["conn-2"].status, Some(Status::Down));
    }

    #[tokio::test]
    async fn test_pending_flag_forces_report_then_clears() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner, &["r1"]);
        let mut reconciler = StatusReconciler::new();
        let pending = reconciler.collect(&mut procs).await;
        reconciler.commit(pending, &mut procs);

        procs.get_mut("r1").unwrap().update().await;
        assert!(procs["r1"].updated_pending_status());

        let pending = reconciler.collect(&mut procs).await;
        assert_eq!(pending.reports.len(), 1);
        assert!(pending.reports[0].updated_pending_status);
        assert!(pending.reports[0].ipsec_site_connections["conn-1"].updated_pending_status);

        reconciler.commit(pending, &mut procs);
        assert!(!procs["r1"].updated_pending_status());
        assert!(reconciler.collect(&mut procs).await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_daemon_reports_connections_down() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner.clone(), &["r1"]);
        let mut reconciler = StatusReconciler::new();
        let pending = reconciler.collect(&mut procs).await;
        assert_eq!(pending.reports[0].ipsec_site_connections["conn-1"].status, Some(Status::Active));
        reconciler.commit(pending, &mut procs);

        runner.fail("ipsec whack", "connect(pluto_ctl) failed");

        let pending = reconciler.collect(&mut procs).await;
        assert_eq!(pending.reports.len(), 1);
        let report = &pending.reports[0];
        assert_eq!(report.status, Status::Down);
        assert!(report
            .ipsec_site_connections
            .values()
            .all(|c| c.status == Some(Status::Down)));
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ipsec whack", BOTH_UP);
        let mut procs = processes(dir.path(), runner, &["r1"]);
        let reconciler = StatusReconciler::new();

        // Report lost: nothing committed
        let _ = reconciler.collect(&mut procs).await;
        assert_eq!(reconciler.collect(&mut procs).await.reports.len(), 1);
    }

    #[tokio::test]
    async fn test_process_without_service_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), Arc::new(RecordingRunner::new()));
        let mut procs = HashMap::new();
        procs.insert("r9".to_string(), factory.create("r9", None, None));

        assert!(StatusReconciler::new().collect(&mut procs).await.is_empty());
    }
}
