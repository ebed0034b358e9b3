use async_trait::async_trait;
use ipnet::IpNet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{VpnError, VpnResult};
use crate::exec::{args, CommandRunner};
use crate::model::{Initiator, VpnService};
use crate::renderer::{ConfigKind, ConfigRenderer};
use super::backend::{ProcessContext, SwanBackend};
use super::common;

/// Openswan backend driven through three `ipsec` subcommands:
/// `pluto` (IKE keying daemon), `addconn` (load a connection) and
/// `whack` (control interface: listen, initiate, terminate, shutdown,
/// status).
pub struct OpenSwanBackend {
    binary: String,
    runner: Arc<dyn CommandRunner>,
    renderer: Arc<dyn ConfigRenderer>,
}

impl OpenSwanBackend {
    pub fn new(binary: &str, runner: Arc<dyn CommandRunner>, renderer: Arc<dyn ConfigRenderer>) -> Self {
        Self {
            binary: binary.to_string(),
            runner,
            renderer,
        }
    }

    fn pid_path(ctx: &ProcessContext<'_>) -> PathBuf {
        ctx.config_dir.join("var").join("run").join("pluto")
    }

    fn config_file(ctx: &ProcessContext<'_>, kind: ConfigKind) -> PathBuf {
        ctx.etc_dir().join(kind.file_name())
    }

    async fn execute(&self, ctx: &ProcessContext<'_>, cmd: Vec<String>, check_exit_code: bool) -> VpnResult<String> {
        self.runner.execute(ctx.namespace, &cmd, check_exit_code).await
    }

    /// `ipsec whack --ctlbase <pid> <extra...>`
    fn whack(&self, ctx: &ProcessContext<'_>, extra: &[&str]) -> Vec<String> {
        let mut cmd = args([self.binary.as_str(), "whack", "--ctlbase"]);
        cmd.push(Self::pid_path(ctx).display().to_string());
        cmd.extend(extra.iter().map(|s| s.to_string()));
        cmd
    }

    /// Next hop towards `address`, or the address itself when no gateway route exists
    async fn get_nexthop(&self, ctx: &ProcessContext<'_>, address: &str) -> String {
        match self.execute(ctx, args(["ip", "route", "get", address]), true).await {
            Ok(routes) => parse_nexthop(&routes).unwrap_or_else(|| address.to_string()),
            Err(e) => {
                debug!("No route to {}: {}", address, e);
                address.to_string()
            }
        }
    }

    async fn disconnect(&self, ctx: &ProcessContext<'_>) {
        if ctx.service.is_none() {
            return;
        }
        for conn_id in &ctx.known_connections {
            let name = format!("{}/0x1", conn_id);
            let cmd = self.whack(ctx, &["--name", &name, "--terminate"]);
            if let Err(e) = self.execute(ctx, cmd, true).await {
                warn!("Failed to terminate connection {} on router {}: {}", conn_id, ctx.id, e);
            }
        }
    }
}

/// Networks the remote side may use: the local subnet plus every peer CIDR,
/// each tagged with its address family (`%v4:10.0.0.0/24`)
pub fn virtual_privates(service: &VpnService) -> VpnResult<String> {
    let nets = std::iter::once(&service.subnet.cidr)
        .chain(service.ipsec_site_connections.iter().flat_map(|c| c.peer_cidrs.iter()));

    let mut privates = Vec::new();
    for net in nets {
        let parsed: IpNet = net
            .parse()
            .map_err(|_| VpnError::validation("VPN Service", "cidr", net.as_str()))?;
        let version = match parsed {
            IpNet::V4(_) => 4,
            IpNet::V6(_) => 6,
        };
        privates.push(format!("%v{}:{}", version, net));
    }
    Ok(privates.join(","))
}

/// `ip route get` prints `<dst> via <gw> dev ...` when a gateway is involved
fn parse_nexthop(routes: &str) -> Option<String> {
    if !routes.contains("via") {
        return None;
    }
    routes.split(' ').nth(2).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[async_trait]
impl SwanBackend for OpenSwanBackend {
    fn name(&self) -> &str {
        "openswan"
    }

    async fn ensure_configs(&self, ctx: &ProcessContext<'_>) -> VpnResult<()> {
        let service = ctx
            .service
            .ok_or_else(|| VpnError::NotFound(format!("No VPN service for router {}", ctx.id)))?;

        common::ensure_config_tree(ctx.config_dir).await?;
        for kind in [ConfigKind::IpsecConf, ConfigKind::IpsecSecrets] {
            let content = self.renderer.render(kind, service)?;
            common::write_secure_config(&Self::config_file(ctx, kind), &content, kind.mode()).await?;
        }
        Ok(())
    }

    async fn start(&self, ctx: &ProcessContext<'_>) -> VpnResult<()> {
        // Without a namespace there is nothing to start yet; the next
        // router event retries.
        if ctx.namespace.is_none() {
            return Ok(());
        }
        let service = match ctx.service {
            Some(service) => service,
            None => return Ok(()),
        };

        let virtual_private = virtual_privates(service)?;
        let pid_path = Self::pid_path(ctx).display().to_string();
        let etc_dir = ctx.etc_dir().display().to_string();
        let secrets_file = Self::config_file(ctx, ConfigKind::IpsecSecrets).display().to_string();
        let config_file = Self::config_file(ctx, ConfigKind::IpsecConf).display().to_string();

        info!("Starting pluto for router {}", ctx.id);
        self.execute(
            ctx,
            args([
                self.binary.as_str(),
                "pluto",
                "--ctlbase", pid_path.as_str(),
                "--ipsecdir", etc_dir.as_str(),
                "--use-netkey",
                "--uniqueids",
                "--nat_traversal",
                "--secretsfile", secrets_file.as_str(),
                "--virtual_private", virtual_private.as_str(),
            ]),
            true,
        )
        .await?;

        let ctl_path = format!("{}.ctl", pid_path);
        for conn in &service.ipsec_site_connections {
            let nexthop = self.get_nexthop(ctx, &conn.peer_address).await;
            self.execute(
                ctx,
                args([
                    self.binary.as_str(),
                    "addconn",
                    "--ctlbase", ctl_path.as_str(),
                    "--defaultroutenexthop", nexthop.as_str(),
                    "--config", config_file.as_str(),
                    conn.id.as_str(),
                ]),
                true,
            )
            .await?;
        }

        // whack --listen exits non-zero even on success
        self.execute(ctx, self.whack(ctx, &["--listen"]), false).await?;

        for conn in service
            .ipsec_site_connections
            .iter()
            .filter(|c| c.initiator == Initiator::BiDirectional)
        {
            debug!("Initiating connection {}", conn.id);
            let cmd = self.whack(ctx, &["--name", &conn.id, "--asynchronous", "--initiate"]);
            self.execute(ctx, cmd, true).await?;
        }

        Ok(())
    }

    async fn stop(&self, ctx: &ProcessContext<'_>) -> VpnResult<()> {
        if ctx.namespace.is_none() {
            return Ok(());
        }
        info!("Stopping pluto for router {}", ctx.id);
        self.disconnect(ctx).await;
        // Shutting down whack also stops pluto
        self.execute(ctx, self.whack(ctx, &["--shutdown"]), true).await?;
        Ok(())
    }

    async fn get_status(&self, ctx: &ProcessContext<'_>) -> VpnResult<String> {
        self.execute(ctx, self.whack(ctx, &["--status"]), true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingRunner;
    use crate::model::fixtures::{site_connection, vpn_service};
    use crate::renderer::SwanConfigRenderer;
    use std::path::Path;

    fn backend(runner: Arc<RecordingRunner>) -> OpenSwanBackend {
        OpenSwanBackend::new("ipsec", runner, Arc::new(SwanConfigRenderer::new()))
    }

    fn context<'a>(config_dir: &'a Path, service: &'a VpnService, known: Vec<&'a str>) -> ProcessContext<'a> {
        ProcessContext {
            id: "r1",
            namespace: Some("qrouter-r1"),
            config_dir,
            service: Some(service),
            known_connections: known,
        }
    }

    #[test]
    fn test_virtual_privates() {
        let service = vpn_service(
            "r1",
            vec![
                site_connection("conn-1", "172.24.4.20", &["10.1.0.0/24", "10.2.0.0/24"]),
                site_connection("conn-2", "2001:db8::1", &["2001:db8:1::/64"]),
            ],
        );
        assert_eq!(
            virtual_privates(&service).unwrap(),
            "%v4:10.0.0.0/24,%v4:10.1.0.0/24,%v4:10.2.0.0/24,%v6:2001:db8:1::/64"
        );
    }

    #[test]
    fn test_virtual_privates_rejects_bad_cidr() {
        let service = vpn_service("r1", vec![site_connection("conn-1", "172.24.4.20", &["not-a-net"])]);
        assert!(virtual_privates(&service).unwrap_err().is_validation());
    }

    #[test]
    fn test_parse_nexthop() {
        assert_eq!(
            parse_nexthop("172.24.4.20 via 172.24.4.1 dev qg-1 src 172.24.4.10\n"),
            Some("172.24.4.1".to_string())
        );
        assert_eq!(parse_nexthop("172.24.4.20 dev qg-1 src 172.24.4.10\n"), None);
    }

    #[tokio::test]
    async fn test_start_command_sequence() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ip route get 172.24.4.20", "172.24.4.20 via 172.24.4.1 dev qg-1 src 172.24.4.10\n");
        runner.fail("ip route get 172.24.4.30", "RTNETLINK answers: Network is unreachable");

        let mut responder = site_connection("conn-2", "172.24.4.30", &["10.2.0.0/24"]);
        responder.initiator = Initiator::ResponseOnly;
        let service = vpn_service("r1", vec![site_connection("conn-1", "172.24.4.20", &["10.1.0.0/24"]), responder]);

        let dir = Path::new("/var/lib/vpnctl/ipsec/r1");
        backend(runner.clone()).start(&context(dir, &service, vec![])).await.unwrap();

        let cmds = runner.commands();
        assert_eq!(cmds.len(), 7);
        assert!(cmds[0].starts_with("ipsec pluto --ctlbase /var/lib/vpnctl/ipsec/r1/var/run/pluto"));
        assert!(cmds[0].ends_with("--virtual_private %v4:10.0.0.0/24,%v4:10.1.0.0/24,%v4:10.2.0.0/24"));
        assert_eq!(cmds[1], "ip route get 172.24.4.20");
        assert_eq!(
            cmds[2],
            "ipsec addconn --ctlbase /var/lib/vpnctl/ipsec/r1/var/run/pluto.ctl --defaultroutenexthop 172.24.4.1 \
             --config /var/lib/vpnctl/ipsec/r1/etc/ipsec.conf conn-1"
        );
        // No route: the peer address doubles as next hop
        assert!(cmds[4].contains("--defaultroutenexthop 172.24.4.30"));
        assert_eq!(cmds[5], "ipsec whack --ctlbase /var/lib/vpnctl/ipsec/r1/var/run/pluto --listen");
        // Only the bi-directional connection is initiated
        assert_eq!(
            cmds[6],
            "ipsec whack --ctlbase /var/lib/vpnctl/ipsec/r1/var/run/pluto --name conn-1 --asynchronous --initiate"
        );
        assert!(runner.namespaces().iter().all(|ns| ns.as_deref() == Some("qrouter-r1")));
    }

    #[tokio::test]
    async fn test_stop_terminates_known_connections_first() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("ipsec whack --ctlbase /tmp/r1/var/run/pluto --name conn-1/0x1", "no such connection");
        let service = vpn_service("r1", vec![]);

        backend(runner.clone())
            .stop(&context(Path::new("/tmp/r1"), &service, vec!["conn-1", "conn-2"]))
            .await
            .unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "ipsec whack --ctlbase /tmp/r1/var/run/pluto --name conn-1/0x1 --terminate",
                "ipsec whack --ctlbase /tmp/r1/var/run/pluto --name conn-2/0x1 --terminate",
                "ipsec whack --ctlbase /tmp/r1/var/run/pluto --shutdown",
            ]
        );
    }

    #[tokio::test]
    async fn test_no_namespace_is_noop() {
        let runner = Arc::new(RecordingRunner::new());
        let service = vpn_service("r1", vec![site_connection("conn-1", "172.24.4.20", &["10.1.0.0/24"])]);
        let mut ctx = context(Path::new("/tmp/r1"), &service, vec!["conn-1"]);
        ctx.namespace = None;

        let backend = backend(runner.clone());
        backend.start(&ctx).await.unwrap();
        backend.stop(&ctx).await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_configs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("r1");
        let service = vpn_service("r1", vec![site_connection("conn-1", "172.24.4.20", &["10.1.0.0/24"])]);
        let backend = backend(Arc::new(RecordingRunner::new()));
        let ctx = context(&config_dir, &service, vec![]);

        backend.ensure_configs(&ctx).await.unwrap();
        let conf_first = std::fs::read(config_dir.join("etc/ipsec.conf")).unwrap();
        let secrets_first = std::fs::read(config_dir.join("etc/ipsec.secrets")).unwrap();

        backend.ensure_configs(&ctx).await.unwrap();
        assert_eq!(std::fs::read(config_dir.join("etc/ipsec.conf")).unwrap(), conf_first);
        assert_eq!(std::fs::read(config_dir.join("etc/ipsec.secrets")).unwrap(), secrets_first);
        assert!(config_dir.join("etc/ipsec.d/cacerts").is_dir());
    }
}
