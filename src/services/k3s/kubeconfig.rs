//! K3s kubeconfig retrieval and patching
//!
//! k3s writes its admin kubeconfig with the API server at 127.0.0.1. Before the
//! file is useful from another machine, the first cluster's server address is
//! pointed at the primary node.

use crate::error::KubeconfigError;
use crate::utils::format::url_host;
use crate::utils::ssh::RemoteSession;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub const LOOPBACK: &str = "127.0.0.1";

/// Default k3s location, used when the data directory copy is missing
pub const DEFAULT_KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// The parts of a kubeconfig we touch; everything else is carried through.
#[derive(Debug, Serialize, Deserialize)]
struct Kubeconfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    clusters: Vec<NamedCluster>,
    #[serde(flatten)]
    rest: Mapping,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster: Option<ClusterEntry>,
    #[serde(flatten)]
    rest: Mapping,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClusterEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(flatten)]
    rest: Mapping,
}

/// Replace the loopback host in the first cluster's server URL.
///
/// Only an exact `127.0.0.1` host is replaced. Returns the re-serialized
/// document and whether a replacement happened.
pub fn patch_server_address(
    document: &[u8],
    real_address: &str,
) -> Result<(Vec<u8>, bool), KubeconfigError> {
    let mut config: Kubeconfig =
        serde_yaml::from_slice(document).map_err(KubeconfigError::Parse)?;

    let server = config
        .clusters
        .first_mut()
        .and_then(|c| c.cluster.as_mut())
        .and_then(|c| c.server.as_mut());

    let mut replaced = false;
    if let Some(server) = server {
        if let Some(patched) = replace_loopback_host(server, real_address)? {
            *server = patched;
            replaced = true;
        }
    }

    let patched = serde_yaml::to_string(&config).map_err(KubeconfigError::Serialize)?;
    Ok((patched.into_bytes(), replaced))
}

/// `server` with its host swapped for `real_address`, or `None` when the host
/// is not the loopback address
fn replace_loopback_host(server: &str, real_address: &str) -> Result<Option<String>, KubeconfigError> {
    let invalid = |reason: String| KubeconfigError::InvalidServer {
        server: server.to_string(),
        reason,
    };

    let mut url = Url::parse(server).map_err(|e| invalid(e.to_string()))?;
    if url.host_str() != Some(LOOPBACK) {
        return Ok(None);
    }
    url.set_host(Some(&url_host(real_address)))
        .map_err(|e| invalid(e.to_string()))?;

    // Url always renders a root path; keep the original form
    let mut patched = url.to_string();
    if url.path() == "/" && !server.ends_with('/') {
        patched.pop();
    }
    Ok(Some(patched))
}

/// Kubeconfig path inside the configured data directory
pub fn data_dir_kubeconfig_path(data_dir: &str) -> String {
    format!("{}/server/cred/k3s.yaml", data_dir.trim_end_matches('/'))
}

/// Download the kubeconfig, trying the data directory first
pub fn fetch(session: &dyn RemoteSession, host: &str, data_dir: &str) -> Result<Vec<u8>, KubeconfigError> {
    let primary_path = data_dir_kubeconfig_path(data_dir);
    tracing::debug!(path = %primary_path, "trying kubeconfig path");
    match session.download_bytes(&primary_path) {
        Ok(content) => Ok(content),
        Err(e) => {
            tracing::debug!(path = DEFAULT_KUBECONFIG_PATH, error = %e, "using fallback path");
            session
                .download_bytes(DEFAULT_KUBECONFIG_PATH)
                .map_err(|source| KubeconfigError::Fetch {
                    host: host.to_string(),
                    tried: format!("{}, {}", primary_path, DEFAULT_KUBECONFIG_PATH),
                    source,
                })
        }
    }
}

/// Write `content` readable and writable by the owner only
pub fn write_private(path: &Path, content: &[u8]) -> Result<(), KubeconfigError> {
    let mut file = open_private(path)?;
    file.write_all(content).map_err(|source| KubeconfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Open `path` truncated, with owner-only permissions in place before any
/// content is written
fn open_private(path: &Path) -> Result<File, KubeconfigError> {
    let write_err = |source| KubeconfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path).map_err(write_err)?;

    // mode() only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    Ok(file)
}
