//! Systemd unit and uninstall script generation
//!
//! Both are pure functions of the node, its role and the cluster settings, so
//! re-running `apply` pushes byte-identical files.

use crate::config::{Cluster, DEFAULT_DATA_DIR, Node};
use crate::utils::format::{shell_escape, url_host};
use std::fmt;

pub const K3S_BINARY_PATH: &str = "/usr/local/bin/k3s";
pub const API_PORT: u16 = 6443;

const UNINSTALL_TEMPLATE: &str = include_str!("uninstall.sh.template");

/// Node role, derived from declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First server: bootstraps the control plane
    Primary,
    /// Other servers: join the primary's control plane
    Secondary,
    Worker,
}

impl Role {
    pub fn is_server(self) -> bool {
        !matches!(self, Role::Worker)
    }

    /// Systemd service name
    pub fn service_name(self) -> &'static str {
        if self.is_server() { "k3s" } else { "k3s-agent" }
    }

    pub fn unit_path(self) -> String {
        format!("/etc/systemd/system/{}.service", self.service_name())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// Join target for secondaries and workers
pub fn join_url(primary_address: &str) -> String {
    format!("https://{}:{}", url_host(primary_address), API_PORT)
}

/// Data directory, falling back to the k3s default
pub fn effective_data_dir(cluster: &Cluster) -> &str {
    if cluster.data_dir.is_empty() {
        DEFAULT_DATA_DIR
    } else {
        &cluster.data_dir
    }
}

/// Ordered k3s arguments; flags with empty values are left out
struct Args(Vec<String>);

impl Args {
    fn new(first: &str) -> Self {
        Self(vec![first.to_string()])
    }

    fn flag(&mut self, name: &str) {
        self.0.push(name.to_string());
    }

    fn opt(&mut self, name: &str, value: &str) {
        if !value.is_empty() {
            self.0.push(name.to_string());
            self.0.push(value.to_string());
        }
    }

    fn each(&mut self, name: &str, values: &[String]) {
        for value in values {
            self.opt(name, value);
        }
    }
}

/// Command line for the k3s process on `node`
pub fn exec_start(node: &Node, primary_address: &str, role: Role, cluster: &Cluster) -> String {
    let mut args = match role {
        Role::Primary => {
            let mut args = Args::new("server");
            args.flag("--cluster-init");
            args
        }
        Role::Secondary => {
            let mut args = Args::new("server");
            args.opt("--server", &join_url(primary_address));
            args
        }
        Role::Worker => {
            let mut args = Args::new("agent");
            args.opt("--server", &join_url(primary_address));
            args
        }
    };

    if role.is_server() {
        args.opt("--flannel-backend", &cluster.flannel_backend);
        args.opt("--cluster-cidr", &cluster.cluster_cidr);
        args.opt("--service-cidr", &cluster.service_cidr);
    }
    args.opt("--data-dir", &cluster.data_dir);
    args.opt("--node-name", &node.node_name);
    if role.is_server() {
        if cluster.embedded_registry {
            args.flag("--embedded-registry");
        }
        args.each("--tls-san", &cluster.tls_san);
        args.each("--disable", &cluster.disable);
    }
    args.each("--node-label", &node.labels);
    args.opt("--token", &cluster.token);

    format!("{} {}", K3S_BINARY_PATH, args.0.join(" "))
}

/// Systemd unit supervising k3s on `node`
pub fn generate_unit(node: &Node, primary_address: &str, role: Role, cluster: &Cluster) -> String {
    let exec = exec_start(node, primary_address, role, cluster);
    format!(
        r#"[Unit]
Description={name}
Documentation=https://k3s.io
Wants=network-online.target
After=network-online.target

[Service]
Type=notify
ExecStartPre=-/sbin/modprobe br_netfilter
ExecStartPre=-/sbin/modprobe overlay
ExecStart={exec}
KillMode=process
Delegate=yes
LimitNOFILE=1048576
LimitNPROC=infinity
LimitCORE=infinity
TasksMax=infinity
TimeoutStartSec=0
Restart=always
RestartSec=5s

[Install]
WantedBy=multi-user.target
"#,
        name = role.service_name(),
        exec = exec,
    )
}

/// Uninstall script placed at `/usr/local/bin/k3s-uninstall.sh`
pub fn generate_uninstall_script(data_dir: &str, is_agent: bool) -> String {
    let data_dir = if data_dir.is_empty() {
        DEFAULT_DATA_DIR
    } else {
        data_dir
    };
    let (service, remove_client) = if is_agent {
        ("k3s-agent", "")
    } else {
        ("k3s", "\nrm -f /usr/local/bin/kubectl\n")
    };

    UNINSTALL_TEMPLATE
        .replace("__SERVICE__", service)
        .replace("__DATA_DIR__", &shell_escape(data_dir))
        .replace("__REMOVE_CLIENT__\n", remove_client)
}
