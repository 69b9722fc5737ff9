//! Cluster declaration loaded from `init.yaml`
//!
//! The config is loaded once, defaults are filled in, and it is validated
//! before anything touches a remote host. After that it is read-only.

mod validate;

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CLUSTER_CIDR: &str = "10.42.0.0/16";
pub const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rancher/k3s";
pub const DEFAULT_FLANNEL_BACKEND: &str = "vxlan";
pub const DEFAULT_K3S_BINARY: &str = "k3s";
pub const DEFAULT_AIRGAP_TARBALL: &str = "k3s-airgap-images-amd64.tar.gz";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";

/// Template written by `k3lift init`.
pub const INIT_TEMPLATE: &str = include_str!("init.yaml.template");

/// Cluster-wide settings shared by every node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Cluster {
    pub flannel_backend: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
    pub token: String,
    pub tls_san: Vec<String>,
    pub disable: Vec<String>,
    pub data_dir: String,
    pub embedded_registry: bool,
    /// Private registry configuration, uploaded verbatim as `registries.yaml`
    pub registries: String,
}

/// Where to find the installable artifacts: a local path or an http(s) URL
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AssetSource {
    pub k3s_binary: String,
    pub k3s_airgap_tarball: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    pub node_name: String,
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub key_path: String,
    pub labels: Vec<String>,
}

impl Node {
    /// SSH user, falling back to root
    pub fn ssh_user(&self) -> &str {
        if self.user.is_empty() {
            DEFAULT_SSH_USER
        } else {
            &self.user
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: Cluster,
    pub assets: AssetSource,
    pub servers: Vec<Node>,
    pub agents: Vec<Node>,
}

impl Config {
    /// Read, default and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        fn or_default(value: &mut String, default: &str) {
            if value.is_empty() {
                *value = default.to_string();
            }
        }

        or_default(&mut self.cluster.cluster_cidr, DEFAULT_CLUSTER_CIDR);
        or_default(&mut self.cluster.service_cidr, DEFAULT_SERVICE_CIDR);
        or_default(&mut self.cluster.data_dir, DEFAULT_DATA_DIR);
        or_default(&mut self.cluster.flannel_backend, DEFAULT_FLANNEL_BACKEND);
        or_default(&mut self.assets.k3s_binary, DEFAULT_K3S_BINARY);
        or_default(&mut self.assets.k3s_airgap_tarball, DEFAULT_AIRGAP_TARBALL);

        for node in self.servers.iter_mut().chain(self.agents.iter_mut()) {
            if node.port == 0 {
                node.port = DEFAULT_SSH_PORT;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml_str(
            r#"
servers:
  - node_name: s1
    ip: 10.0.0.1
    password: secret
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.cluster_cidr, DEFAULT_CLUSTER_CIDR);
        assert_eq!(config.cluster.service_cidr, DEFAULT_SERVICE_CIDR);
        assert_eq!(config.cluster.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(config.cluster.flannel_backend, DEFAULT_FLANNEL_BACKEND);
        assert_eq!(config.assets.k3s_binary, "k3s");
        assert_eq!(config.assets.k3s_airgap_tarball, DEFAULT_AIRGAP_TARBALL);
        assert_eq!(config.servers[0].port, 22);
        assert_eq!(config.servers[0].ssh_user(), "root");
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_full_declaration() {
        let config = Config::from_yaml_str(
            r#"
cluster:
  cluster-cidr: 10.52.0.0/16
  service-cidr: 10.53.0.0/16
  token: abc
  tls-san: [k8s.lan]
  disable: [traefik, servicelb]
  data-dir: /data/k3s
  embedded-registry: true
  registries: |
    mirrors:
      docker.io:
        endpoint: ["http://10.0.0.9:5000"]
assets:
  k3s-binary: https://example.com/k3s
servers:
  - node_name: s1
    ip: 10.0.0.1
    port: 2222
    user: ops
    key_path: ~/.ssh/id_ed25519
    labels: [zone=a]
agents:
  - node_name: a1
    ip: 10.0.0.10
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.tls_san, vec!["k8s.lan"]);
        assert_eq!(config.cluster.disable.len(), 2);
        assert!(config.cluster.embedded_registry);
        assert!(config.cluster.registries.starts_with("mirrors:"));
        assert_eq!(config.assets.k3s_binary, "https://example.com/k3s");
        assert_eq!(config.servers[0].port, 2222);
        assert_eq!(config.servers[0].ssh_user(), "ops");
        assert_eq!(config.agents[0].port, 22);
    }

    #[test]
    fn test_invalid_config_rejected_on_load() {
        let err = Config::from_yaml_str(
            r#"
cluster:
  cluster-cidr: 10.42.0.0/16
  service-cidr: 10.42.0.0/16
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::IdenticalCidrs(_)));
    }

    #[test]
    fn test_template_parses() {
        let config = Config::from_yaml_str(INIT_TEMPLATE).unwrap();
        assert_eq!(config.servers.len(), 3);
    }
}
