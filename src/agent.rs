//! Host router plumbing used by the driver
//!
//! Routers live in network namespaces named `<prefix><router id>`. NAT
//! rules are queued per router and only reach iptables on
//! [`RouterAgent::iptables_apply`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::VpnResult;
use crate::exec::{args, CommandRunner};

/// Router services the host agent provides
#[async_trait]
pub trait RouterAgent: Send + Sync {
    /// Namespace of a router, `None` while it does not exist
    async fn get_namespace(&self, router_id: &str) -> Option<String>;

    /// Queue a rule for `chain` of the nat table; `top` inserts it first
    async fn add_nat_rule(&self, router_id: &str, chain: &str, rule: &str, top: bool);

    /// Queue removal of a rule from `chain` of the nat table
    async fn remove_nat_rule(&self, router_id: &str, chain: &str, rule: &str, top: bool);

    /// Apply every queued change for a router
    async fn iptables_apply(&self, router_id: &str) -> VpnResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NatChange {
    Add { chain: String, rule: String, top: bool },
    Remove { chain: String, rule: String },
}

/// Agent backed by `ip netns` and `iptables` inside router namespaces
pub struct NetnsRouterAgent {
    netns_dir: PathBuf,
    namespace_prefix: String,
    runner: Arc<dyn CommandRunner>,
    queued: Mutex<HashMap<String, Vec<NatChange>>>,
}

impl NetnsRouterAgent {
    pub fn new(config: &AgentConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            netns_dir: config.agent.netns_dir.clone(),
            namespace_prefix: config.agent.namespace_prefix.clone(),
            runner,
            queued: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace_name(&self, router_id: &str) -> String {
        format!("{}{}", self.namespace_prefix, router_id)
    }

    fn iptables(table_op: &str, chain: &str, rule: &str, top: bool) -> Vec<String> {
        let mut cmd = args(["iptables", "-t", "nat", table_op, chain]);
        if top {
            cmd.push("1".to_string());
        }
        cmd.extend(rule.split_whitespace().map(str::to_string));
        cmd
    }

    async fn apply_change(&self, namespace: &str, change: &NatChange) -> VpnResult<()> {
        match change {
            NatChange::Add { chain, rule, top } => {
                let check = Self::iptables("-C", chain, rule, false);
                if self.runner.execute(Some(namespace), &check, true).await.is_ok() {
                    debug!("NAT rule already present in {}: {}", namespace, rule);
                    return Ok(());
                }
                let op = if *top { "-I" } else { "-A" };
                self.runner
                    .execute(Some(namespace), &Self::iptables(op, chain, rule, *top), true)
                    .await?;
            }
            NatChange::Remove { chain, rule } => {
                // Deleting an absent rule is not an error
                self.runner
                    .execute(Some(namespace), &Self::iptables("-D", chain, rule, false), false)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RouterAgent for NetnsRouterAgent {
    async fn get_namespace(&self, router_id: &str) -> Option<String> {
        let name = self.namespace_name(router_id);
        if tokio::fs::metadata(self.netns_dir.join(&name)).await.is_ok() {
            Some(name)
        } else {
            None
        }
    }

    async fn add_nat_rule(&self, router_id: &str, chain: &str, rule: &str, top: bool) {
        self.queued.lock().await.entry(router_id.to_string()).or_default().push(NatChange::Add {
            chain: chain.to_string(),
            rule: rule.to_string(),
            top,
        });
    }

    async fn remove_nat_rule(&self, router_id: &str, chain: &str, rule: &str, _top: bool) {
        self.queued.lock().await.entry(router_id.to_string()).or_default().push(NatChange::Remove {
            chain: chain.to_string(),
            rule: rule.to_string(),
        });
    }

    async fn iptables_apply(&self, router_id: &str) -> VpnResult<()> {
        let changes = self.queued.lock().await.remove(router_id).unwrap_or_default();
        if changes.is_empty() {
            return Ok(());
        }
        let Some(namespace) = self.get_namespace(router_id).await else {
            debug!("Router {} has no namespace, dropping {} NAT changes", router_id, changes.len());
            return Ok(());
        };

        info!("Applying {} NAT changes on router {}", changes.len(), router_id);
        for change in &changes {
            self.apply_change(&namespace, change).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingRunner;

    const RULE: &str = "-s 10.0.0.0/24 -d 10.1.0.0/24 -m policy --dir out --pol ipsec -j ACCEPT";

    fn agent(netns_dir: &std::path::Path, runner: Arc<RecordingRunner>) -> NetnsRouterAgent {
        let mut config = AgentConfig::default();
        config.agent.netns_dir = netns_dir.to_path_buf();
        NetnsRouterAgent::new(&config, runner)
    }

    #[tokio::test]
    async fn test_get_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qrouter-r1"), "").unwrap();
        let agent = agent(dir.path(), Arc::new(RecordingRunner::new()));

        assert_eq!(agent.get_namespace("r1").await.as_deref(), Some("qrouter-r1"));
        assert_eq!(agent.get_namespace("r2").await, None);
    }

    #[tokio::test]
    async fn test_apply_inserts_missing_rule_at_top() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qrouter-r1"), "").unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("iptables -t nat -C", "Bad rule");
        let agent = agent(dir.path(), runner.clone());

        agent.add_nat_rule("r1", "POSTROUTING", RULE, true).await;
        agent.iptables_apply("r1").await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                format!("iptables -t nat -C POSTROUTING {}", RULE),
                format!("iptables -t nat -I POSTROUTING 1 {}", RULE),
            ]
        );
        assert!(runner.namespaces().iter().all(|ns| ns.as_deref() == Some("qrouter-r1")));

        // Queue drained
        runner.clear();
        agent.iptables_apply("r1").await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_existing_rule_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qrouter-r1"), "").unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let agent = agent(dir.path(), runner.clone());

        agent.add_nat_rule("r1", "POSTROUTING", RULE, true).await;
        agent.remove_nat_rule("r1", "POSTROUTING", RULE, true).await;
        agent.iptables_apply("r1").await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                format!("iptables -t nat -C POSTROUTING {}", RULE),
                format!("iptables -t nat -D POSTROUTING {}", RULE),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_without_namespace_drops_changes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let agent = agent(dir.path(), runner.clone());

        agent.add_nat_rule("r1", "POSTROUTING", RULE, true).await;
        agent.iptables_apply("r1").await.unwrap();
        assert!(runner.commands().is_empty());
    }
}
