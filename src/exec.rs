//! Command execution inside router network namespaces

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{VpnError, VpnResult};

/// Runs external commands, optionally inside a named network namespace
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` and return its stdout.
    ///
    /// With `check_exit_code` a non-zero exit is an error; without it the
    /// output is returned regardless of the exit status.
    async fn execute(
        &self,
        namespace: Option<&str>,
        cmd: &[String],
        check_exit_code: bool,
    ) -> VpnResult<String>;
}

/// Executes through `ip netns exec`, prefixed by an optional root helper
pub struct NetnsRunner {
    root_helper: Vec<String>,
}

impl NetnsRunner {
    pub fn new(root_helper: Option<&str>) -> Self {
        Self {
            root_helper: root_helper
                .map(|h| h.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    fn full_command(&self, namespace: Option<&str>, cmd: &[String]) -> Vec<String> {
        let mut full = self.root_helper.clone();
        if let Some(ns) = namespace {
            full.extend(["ip", "netns", "exec", ns].iter().map(|s| s.to_string()));
        }
        full.extend(cmd.iter().cloned());
        full
    }
}

impl Default for NetnsRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl CommandRunner for NetnsRunner {
    async fn execute(
        &self,
        namespace: Option<&str>,
        cmd: &[String],
        check_exit_code: bool,
    ) -> VpnResult<String> {
        let full = self.full_command(namespace, cmd);
        let (program, args) = full
            .split_first()
            .ok_or_else(|| VpnError::ServiceError("Empty command".to_string()))?;

        debug!("Running command: {}", full.join(" "));
        let output = Command::new(program).args(args).output().await?;

        if check_exit_code && !output.status.success() {
            return Err(VpnError::CommandFailed {
                cmd: full.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Build an owned argument vector from string slices
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|s| s.as_ref().to_string()).collect()
}
