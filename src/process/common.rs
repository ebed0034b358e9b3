//! Filesystem helpers shared by process backends

use crate::error::{VpnError, VpnResult};
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Subdirectories every process configuration tree carries
pub const CONFIG_DIRS: &[&str] = &[
    "var/run",
    "log",
    "etc",
    "etc/ipsec.d/aacerts",
    "etc/ipsec.d/acerts",
    "etc/ipsec.d/cacerts",
    "etc/ipsec.d/certs",
    "etc/ipsec.d/crls",
    "etc/ipsec.d/ocspcerts",
    "etc/ipsec.d/policies",
    "etc/ipsec.d/private",
    "etc/ipsec.d/reqs",
    "etc/pki/nssdb",
];

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> VpnResult<()> {
    if !path.is_dir() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to create directory {:?}: {}", path, e)))?;
        debug!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Create the configuration root and its fixed subdirectory layout
pub async fn ensure_config_tree(config_dir: &Path) -> VpnResult<()> {
    ensure_directory_exists(config_dir).await?;
    for subdir in CONFIG_DIRS {
        ensure_directory_exists(&config_dir.join(subdir)).await?;
    }
    Ok(())
}

/// Temporary sibling used while replacing `path`
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace a configuration file (with appropriate permissions)
///
/// The staging file is created with `permissions` before any content is
/// written, so secrets are never readable under a wider mode.
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> VpnResult<()> {
    // Readers never observe a partially written file
    let tmp_path = staging_path(path);
    match tokio::fs::remove_file(&tmp_path).await {
        Ok(()) => debug!("Removed stale {:?}", tmp_path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(VpnError::ServiceError(format!("Failed to remove {:?}: {}", tmp_path, e)));
        }
    }

    let write_err = |e: std::io::Error| {
        VpnError::ServiceError(format!("Failed to write config to {:?}: {}", tmp_path, e))
    };
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(permissions)
        .open(&tmp_path)
        .await
        .map_err(write_err)?;
    file.write_all(content.as_bytes()).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    // The umask may have narrowed the creation mode further
    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(&tmp_path, perms)
        .await
        .map_err(|e| VpnError::ServiceError(format!("Failed to set permissions on {:?}: {}", tmp_path, e)))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| VpnError::ServiceError(format!("Failed to replace {:?}: {}", path, e)))?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Remove a whole configuration tree, ignoring errors
pub async fn remove_config_tree(config_dir: &Path) {
    match tokio::fs::remove_dir_all(config_dir).await {
        Ok(()) => info!("Removed config directory: {:?}", config_dir),
        Err(e) => debug!("Config directory {:?} not removed: {}", config_dir, e),
    }
}
