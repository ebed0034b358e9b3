use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::VpnResult;
use crate::model::VpnService;

/// Read-only view of a process handed to its backend on every call
#[derive(Debug, Clone)]
pub struct ProcessContext<'a> {
    /// Process id (the router id)
    pub id: &'a str,
    /// Router namespace; `None` until the router's namespace exists
    pub namespace: Option<&'a str>,
    /// Root of the per-process configuration tree
    pub config_dir: &'a Path,
    /// Cached service description
    pub service: Option<&'a VpnService>,
    /// Connections the daemon has reported so far
    pub known_connections: Vec<&'a str>,
}

impl ProcessContext<'_> {
    pub fn etc_dir(&self) -> PathBuf {
        self.config_dir.join("etc")
    }
}

/// Capability interface every keying daemon backend implements.
///
/// Backends hold no per-process state; the process owns status tracking and
/// passes itself in as a [`ProcessContext`].
#[async_trait]
pub trait SwanBackend: Send + Sync {
    /// Backend name (e.g., "openswan")
    fn name(&self) -> &str;

    /// Regenerate the configuration tree for the process
    async fn ensure_configs(&self, ctx: &ProcessContext<'_>) -> VpnResult<()>;

    /// Start the keying daemon and bring up connections
    async fn start(&self, ctx: &ProcessContext<'_>) -> VpnResult<()>;

    /// Terminate connections and stop the keying daemon
    async fn stop(&self, ctx: &ProcessContext<'_>) -> VpnResult<()>;

    /// Restart the keying daemon
    async fn restart(&self, ctx: &ProcessContext<'_>) -> VpnResult<()> {
        self.stop(ctx).await?;
        self.start(ctx).await
    }

    /// Raw daemon status text; an error means the daemon is not running
    async fn get_status(&self, ctx: &ProcessContext<'_>) -> VpnResult<String>;
}
