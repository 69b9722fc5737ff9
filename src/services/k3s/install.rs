//! Cluster bring-up
//!
//! Servers are provisioned one at a time in declared order: the first becomes
//! the primary and the rest join it. Agents follow, sequentially by default or
//! through a bounded worker pool. The first failure stops the run; nodes that
//! already finished are left as they are.

use super::kubeconfig;
use super::units::{
    API_PORT, K3S_BINARY_PATH, Role, effective_data_dir, generate_uninstall_script,
    generate_unit,
};
use crate::config::{Config, Node};
use crate::error::{Error, RemoteError, Result};
use crate::services::assets::AssetManager;
use crate::utils::format::{format_bytes, url_host};
use crate::utils::ssh::{Connector, RemoteSession, SshTarget};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;
use tracing::Dispatch;

pub const KUBECTL_PATH: &str = "/usr/local/bin/kubectl";
pub const UNINSTALL_SCRIPT_PATH: &str = "/usr/local/bin/k3s-uninstall.sh";
pub const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";
pub const AIRGAP_IMAGES_NAME: &str = "k3s-airgap-images-amd64.tar.gz";

/// Binary is uploaded here first and moved into place once verified, so a
/// running k3s never sees a partially written file.
const BINARY_STAGING_PATH: &str = "/usr/local/bin/.k3s.upload";

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Runtime policy for one `apply` run
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Fallback lookup directory for relative artifact paths
    pub assets_dir: PathBuf,
    /// Wait after (re)starting a service before moving on
    pub settle_delay: Duration,
    /// Number of agents provisioned concurrently. 1 means sequential.
    pub agent_parallelism: usize,
    /// Where the patched kubeconfig is written locally
    pub kubeconfig_path: PathBuf,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("assets"),
            settle_delay: DEFAULT_SETTLE_DELAY,
            agent_parallelism: 1,
            kubeconfig_path: PathBuf::from("kubeconfig"),
        }
    }
}

/// Where a node's provisioning sequence was when it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStage {
    Connecting,
    Preparing,
    UploadingAssets,
    ConfiguringService,
    Starting,
    LinkingClient,
    Done,
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            NodeStage::Connecting => "connecting",
            NodeStage::Preparing => "preparing directories",
            NodeStage::UploadingAssets => "uploading assets",
            NodeStage::ConfiguringService => "configuring service",
            NodeStage::Starting => "starting service",
            NodeStage::LinkingClient => "linking kubectl",
            NodeStage::Done => "finishing",
        };
        f.write_str(stage)
    }
}

/// Drives the bring-up of every declared node.
///
/// One installer serves one run: its asset temp directory is released when
/// `apply` returns, successful or not.
pub struct Installer {
    config: Config,
    options: InstallOptions,
    assets: AssetManager,
    connector: Box<dyn Connector>,
    dispatch: Dispatch,
}

impl Installer {
    /// `dispatch` receives every log event of the run, including those from
    /// agent worker threads.
    pub fn new(
        config: Config,
        options: InstallOptions,
        connector: Box<dyn Connector>,
        dispatch: Dispatch,
    ) -> Result<Self> {
        let assets = AssetManager::new(&options.assets_dir)?;
        Ok(Self {
            config,
            options,
            assets,
            connector,
            dispatch,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Provision every node, then fetch the kubeconfig from the primary.
    pub fn apply(&self) -> Result<()> {
        tracing::dispatcher::with_default(&self.dispatch, || {
            let result = self.run();
            if let Err(e) = self.assets.cleanup() {
                tracing::warn!(error = %e, "failed to remove downloaded assets");
            }
            result
        })
    }

    fn run(&self) -> Result<()> {
        let primary = self.config.servers.first().ok_or(Error::NoServers)?;
        tracing::info!(
            servers = self.config.servers.len(),
            agents = self.config.agents.len(),
            primary = %node_label(primary),
            "starting cluster installation"
        );

        for (idx, server) in self.config.servers.iter().enumerate() {
            let role = if idx == 0 {
                Role::Primary
            } else {
                Role::Secondary
            };
            self.provision_node(server, &primary.ip, role)?;
        }

        self.provision_agents(&primary.ip)?;

        if let Err(e) = self.download_kubeconfig(primary) {
            tracing::warn!(error = %e, "failed to download kubeconfig");
        }
        self.show_cluster_info(primary);
        self.print_success_summary(primary);
        Ok(())
    }

    fn provision_agents(&self, primary_address: &str) -> Result<()> {
        let agents = &self.config.agents;
        let workers = self.options.agent_parallelism.clamp(1, agents.len().max(1));
        if workers == 1 {
            for agent in agents {
                self.provision_node(agent, primary_address, Role::Worker)?;
            }
            return Ok(());
        }

        tracing::info!(workers, agents = agents.len(), "provisioning agents in parallel");
        let (jobs_tx, jobs_rx) = mpsc::channel::<&Node>();
        for agent in agents {
            // Receiver is alive until the scope below ends
            let _ = jobs_tx.send(agent);
        }
        drop(jobs_tx);

        let jobs = Mutex::new(jobs_rx);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    tracing::dispatcher::with_default(&self.dispatch, || {
                        while !failed.load(Ordering::SeqCst) {
                            let next = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
                            let Ok(agent) = next else {
                                break;
                            };
                            if let Err(e) = self.provision_node(agent, primary_address, Role::Worker) {
                                failed.store(true, Ordering::SeqCst);
                                first_error
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .get_or_insert(e);
                                break;
                            }
                        }
                    })
                });
            }
        });

        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run the provisioning sequence for one node, tagging any failure with the
    /// node and the stage it reached.
    fn provision_node(&self, node: &Node, primary_address: &str, role: Role) -> Result<()> {
        let span = tracing::info_span!("node", name = %node_label(node), ip = %node.ip, %role);
        let _enter = span.enter();

        match role {
            Role::Primary => tracing::info!("initializing primary server"),
            Role::Secondary => tracing::info!(primary = primary_address, "joining control plane"),
            Role::Worker => tracing::info!(server = primary_address, "joining worker node"),
        }

        let mut stage = NodeStage::Connecting;
        self.provision_steps(node, primary_address, role, &mut stage)
            .map_err(|source| Error::Node {
                node: node_label(node),
                stage,
                source: Box::new(source),
            })?;
        tracing::info!("node provisioned");
        Ok(())
    }

    fn provision_steps(
        &self,
        node: &Node,
        primary_address: &str,
        role: Role,
        stage: &mut NodeStage,
    ) -> Result<()> {
        let cluster = &self.config.cluster;
        let data_dir = effective_data_dir(cluster);

        *stage = NodeStage::Connecting;
        let session = self.connector.open(&SshTarget::for_node(node))?;
        tracing::info!("SSH connected");

        *stage = NodeStage::Preparing;
        prepare_node(session.as_ref(), data_dir)?;

        *stage = NodeStage::UploadingAssets;
        self.upload_assets(session.as_ref(), data_dir)?;

        *stage = NodeStage::ConfiguringService;
        tracing::debug!(path = UNINSTALL_SCRIPT_PATH, "uploading uninstall script");
        let script = generate_uninstall_script(&cluster.data_dir, !role.is_server());
        session.upload_bytes(script.as_bytes(), UNINSTALL_SCRIPT_PATH)?;
        session.run_command(&format!("chmod +x {}", UNINSTALL_SCRIPT_PATH))?;

        let unit_path = role.unit_path();
        tracing::debug!(path = %unit_path, "uploading systemd unit");
        let unit = generate_unit(node, primary_address, role, cluster);
        session.upload_bytes(unit.as_bytes(), &unit_path)?;

        *stage = NodeStage::Starting;
        let service = role.service_name();
        tracing::debug!("systemctl daemon-reload");
        session.run_command("systemctl daemon-reload")?;
        tracing::debug!(service, "systemctl enable");
        session.run_command(&format!("systemctl enable {}", service))?;
        tracing::info!(service, "starting service");
        session.run_command(&format!("systemctl restart {}", service))?;

        tracing::debug!(seconds = self.options.settle_delay.as_secs_f64(), "waiting for service to start");
        thread::sleep(self.options.settle_delay);

        if role.is_server() {
            *stage = NodeStage::LinkingClient;
            tracing::debug!(path = KUBECTL_PATH, "linking kubectl");
            session.run_command(&format!("ln -sf {} {}", K3S_BINARY_PATH, KUBECTL_PATH))?;
        }

        *stage = NodeStage::Done;
        Ok(())
    }

    fn upload_assets(&self, session: &dyn RemoteSession, data_dir: &str) -> Result<()> {
        let sources = &self.config.assets;

        let binary = self.assets.resolve_asset(&sources.k3s_binary, "k3s binary")?;
        upload_binary(session, &binary)?;

        if sources.k3s_airgap_tarball.is_empty() {
            tracing::debug!("no images archive configured");
        } else {
            match self.assets.resolve_asset(&sources.k3s_airgap_tarball, "airgap images") {
                Ok(images) => {
                    let remote = format!("{}/{}", images_dir(data_dir), AIRGAP_IMAGES_NAME);
                    if let Ok(meta) = std::fs::metadata(&images) {
                        tracing::info!(size = %format_bytes(meta.len()), "uploading airgap images archive");
                    }
                    session.upload_file(&images, &remote, true)?;
                }
                Err(e) => tracing::warn!(reason = %e, "skipping images archive"),
            }
        }

        let registries = &self.config.cluster.registries;
        if !registries.is_empty() {
            tracing::debug!(path = REGISTRIES_PATH, "uploading registries.yaml");
            session.upload_bytes(registries.as_bytes(), REGISTRIES_PATH)?;
        }
        Ok(())
    }

    fn download_kubeconfig(&self, primary: &Node) -> Result<()> {
        tracing::info!(node = %node_label(primary), "downloading kubeconfig");
        let session = self.connector.open(&SshTarget::for_node(primary))?;
        let content = kubeconfig::fetch(
            session.as_ref(),
            &primary.ip,
            effective_data_dir(&self.config.cluster),
        )?;

        let (patched, replaced) = kubeconfig::patch_server_address(&content, &primary.ip)?;
        if replaced {
            tracing::debug!(address = %primary.ip, "pointed kubeconfig at primary");
        }
        kubeconfig::write_private(&self.options.kubeconfig_path, &patched)?;
        tracing::info!(path = %self.options.kubeconfig_path.display(), "kubeconfig saved");
        Ok(())
    }

    fn show_cluster_info(&self, primary: &Node) {
        let session = match self.connector.open(&SshTarget::for_node(primary)) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "failed to connect to primary node");
                return;
            }
        };
        match session.run_command("kubectl get nodes") {
            Ok(output) => {
                println!("Cluster Nodes:");
                println!("{}", output.stdout);
            }
            Err(e) => tracing::error!(error = %e, "failed to get nodes"),
        }
    }

    fn print_success_summary(&self, primary: &Node) {
        let rule = "=".repeat(51);
        let kubeconfig = absolute(&self.options.kubeconfig_path);
        println!();
        println!("{}", rule);
        println!("✓ Installation completed successfully!");
        println!("{}", rule);
        println!();
        println!("To access your cluster, set the KUBECONFIG environment variable:");
        println!("  export KUBECONFIG={}", kubeconfig.display());
        println!();
        println!("Then run kubectl commands:");
        println!("  kubectl get nodes");
        println!("  kubectl get pods -A");
        println!();
        println!("API Server: https://{}:{}", url_host(&primary.ip), API_PORT);
        if which::which("kubectl").is_err() {
            println!();
            println!("⚠ kubectl not found in PATH. Install kubectl to use cluster commands.");
            println!("   https://kubernetes.io/docs/tasks/tools/");
        }
        println!();
    }
}

fn node_label(node: &Node) -> String {
    if node.node_name.is_empty() {
        node.ip.clone()
    } else {
        node.node_name.clone()
    }
}

fn images_dir(data_dir: &str) -> String {
    format!("{}/agent/images", data_dir.trim_end_matches('/'))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn prepare_node(session: &dyn RemoteSession, data_dir: &str) -> Result<()> {
    tracing::info!("preparing node environment");
    for dir in ["/usr/local/bin".to_string(), images_dir(data_dir), "/etc/rancher/k3s".to_string()] {
        tracing::debug!(path = %dir, "creating directory");
        session.mkdir_all(&dir)?;
    }
    Ok(())
}

/// Upload to a staging path, check the size, then move into place
fn upload_binary(session: &dyn RemoteSession, local: &Path) -> Result<()> {
    let local_size = std::fs::metadata(local)
        .map_err(|source| RemoteError::Transfer {
            path: local.display().to_string(),
            source,
        })?
        .len();
    tracing::info!(size = %format_bytes(local_size), "uploading k3s binary");
    session.upload_file(local, BINARY_STAGING_PATH, true)?;

    let remote_size = session.file_size(BINARY_STAGING_PATH)?;
    if remote_size != local_size {
        return Err(RemoteError::SizeMismatch {
            path: BINARY_STAGING_PATH.to_string(),
            local: local_size,
            remote: remote_size,
        }
        .into());
    }

    tracing::debug!(path = K3S_BINARY_PATH, mode = "755", "setting permissions");
    session.run_command(&format!(
        "chmod 755 {staging} && mv -f {staging} {target}",
        staging = BINARY_STAGING_PATH,
        target = K3S_BINARY_PATH
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AssetError, ConnectionError};
    use crate::utils::ssh::mock::{MockConnector, Op};
    use tempfile::TempDir;

    const KUBECONFIG: &str = "apiVersion: v1
clusters:
- cluster:
    server: https://127.0.0.1:6443
  name: default
kind: Config
";

    struct Fixture {
        dir: TempDir,
        binary: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("k3s");
            std::fs::write(&binary, b"\x7fELF k3s binary").unwrap();
            Self { dir, binary }
        }

        fn config(&self, servers: &[(&str, &str)], agents: &[(&str, &str)]) -> Config {
            let node = |(name, ip): &(&str, &str)| Node {
                node_name: name.to_string(),
                ip: ip.to_string(),
                port: 22,
                password: "pw".to_string(),
                ..Default::default()
            };
            let mut config = Config::from_yaml_str("cluster:\n  token: s3cret\n").unwrap();
            config.assets.k3s_binary = self.binary.display().to_string();
            config.assets.k3s_airgap_tarball = String::new();
            config.servers = servers.iter().map(node).collect();
            config.agents = agents.iter().map(node).collect();
            config
        }

        fn options(&self) -> InstallOptions {
            InstallOptions {
                assets_dir: self.dir.path().join("assets"),
                settle_delay: Duration::ZERO,
                agent_parallelism: 1,
                kubeconfig_path: self.dir.path().join("kubeconfig"),
            }
        }

        fn installer(&self, config: Config, connector: &MockConnector) -> Installer {
            self.installer_with(config, self.options(), connector)
        }

        fn installer_with(&self, config: Config, options: InstallOptions, connector: &MockConnector) -> Installer {
            Installer::new(config, options, Box::new(connector.clone()), Dispatch::none()).unwrap()
        }
    }

    fn unit(connector: &MockConnector, host: &str, role: Role) -> String {
        connector.file_text(host, &role.unit_path()).unwrap()
    }

    #[test]
    fn test_three_servers_roles_and_join_target() {
        let fx = Fixture::new();
        let connector = MockConnector::new().with_file("10.0.0.1", kubeconfig::DEFAULT_KUBECONFIG_PATH, KUBECONFIG.as_bytes());
        let config = fx.config(&[("s1", "10.0.0.1"), ("s2", "10.0.0.2"), ("s3", "10.0.0.3")], &[]);

        fx.installer(config, &connector).apply().unwrap();

        let primary = unit(&connector, "10.0.0.1", Role::Primary);
        assert!(primary.contains("server --cluster-init"));
        assert!(!primary.contains("--server "));
        for host in ["10.0.0.2", "10.0.0.3"] {
            let secondary = unit(&connector, host, Role::Secondary);
            assert!(secondary.contains("server --server https://10.0.0.1:6443"));
            assert!(!secondary.contains("--cluster-init"));
        }

        // Each server gets its own session, in declared order
        let hosts = connector.connected_hosts();
        assert_eq!(&hosts[..3], ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_provisioning_sequence_order() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let config = fx.config(&[("s1", "10.0.0.1")], &[]);

        fx.installer(config, &connector).apply().unwrap();

        let commands = connector.commands("10.0.0.1");
        let position = |needle: &str| {
            commands
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("missing command {needle}"))
        };
        assert!(position("mv -f /usr/local/bin/.k3s.upload /usr/local/bin/k3s") < position("chmod +x /usr/local/bin/k3s-uninstall.sh"));
        assert!(position("chmod +x /usr/local/bin/k3s-uninstall.sh") < position("systemctl daemon-reload"));
        assert!(position("systemctl daemon-reload") < position("systemctl enable k3s"));
        assert!(position("systemctl enable k3s") < position("systemctl restart k3s"));
        assert!(position("systemctl restart k3s") < position("ln -sf /usr/local/bin/k3s /usr/local/bin/kubectl"));

        let ops = connector.ops();
        assert!(ops.contains(&Op::Mkdir {
            host: "10.0.0.1".to_string(),
            path: "/var/lib/rancher/k3s/agent/images".to_string()
        }));
        assert_eq!(
            connector.file("10.0.0.1", "/usr/local/bin/.k3s.upload").unwrap(),
            std::fs::read(&fx.binary).unwrap()
        );
        let script = connector.file_text("10.0.0.1", UNINSTALL_SCRIPT_PATH).unwrap();
        assert!(script.contains("SERVICE=k3s\n"));
    }

    #[test]
    fn test_secondary_failure_stops_the_run() {
        let fx = Fixture::new();
        let connector = MockConnector::new().fail_command("10.0.0.2", "systemctl restart k3s");
        let config = fx.config(&[("s1", "10.0.0.1"), ("s2", "10.0.0.2"), ("s3", "10.0.0.3")], &[]);

        let err = fx.installer(config, &connector).apply().unwrap_err();

        match &err {
            Error::Node { node, stage, .. } => {
                assert_eq!(node, "s2");
                assert_eq!(*stage, NodeStage::Starting);
            }
            other => panic!("unexpected error: {other}"),
        }
        match err.root() {
            Error::Remote(RemoteError::Exec { command, status, stderr, .. }) => {
                assert_eq!(command, "systemctl restart k3s");
                assert_eq!(*status, 1);
                assert_eq!(stderr, "mock failure");
            }
            other => panic!("unexpected root error: {other}"),
        }
        assert!(!connector.connected_hosts().contains(&"10.0.0.3".to_string()));
        // s2 never got as far as the kubectl link
        assert!(!connector.commands("10.0.0.2").iter().any(|c| c.starts_with("ln -sf")));
    }

    #[test]
    fn test_no_servers() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let config = fx.config(&[], &[("w1", "10.0.1.1")]);

        let err = fx.installer(config, &connector).apply().unwrap_err();
        assert!(matches!(err, Error::NoServers));
        assert!(connector.ops().is_empty());
    }

    #[test]
    fn test_unreachable_node_is_connection_error() {
        let fx = Fixture::new();
        let connector = MockConnector::new().refuse("10.0.0.1");
        let config = fx.config(&[("s1", "10.0.0.1")], &[]);

        let err = fx.installer(config, &connector).apply().unwrap_err();
        assert!(matches!(err, Error::Node { stage: NodeStage::Connecting, .. }));
        assert!(matches!(err.root(), Error::Connection(ConnectionError::Tcp { .. })));
    }

    #[test]
    fn test_missing_binary_aborts_with_hint() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let mut config = fx.config(&[("s1", "10.0.0.1")], &[]);
        config.assets.k3s_binary = "k3s".to_string();
        let mut options = fx.options();
        options.assets_dir = fx.dir.path().join("no-such-dir");

        let err = fx.installer_with(config, options, &connector).apply().unwrap_err();
        assert!(matches!(err, Error::Node { stage: NodeStage::UploadingAssets, .. }));
        match err.root() {
            Error::Asset(e @ AssetError::NotFound { .. }) => {
                assert!(e.to_string().contains("https://github.com/k3s-io/k3s/releases"));
            }
            other => panic!("unexpected root error: {other}"),
        }
        assert!(connector.commands("10.0.0.1").is_empty());
    }

    #[test]
    fn test_missing_images_archive_only_warns() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let mut config = fx.config(&[("s1", "10.0.0.1")], &[]);
        config.assets.k3s_airgap_tarball = fx.dir.path().join("missing.tar.gz").display().to_string();

        fx.installer(config, &connector).apply().unwrap();
        assert!(connector.commands("10.0.0.1").contains(&"systemctl restart k3s".to_string()));
    }

    #[test]
    fn test_images_archive_and_registries_uploaded() {
        let fx = Fixture::new();
        let images = fx.dir.path().join("images.tar.gz");
        std::fs::write(&images, b"images").unwrap();

        let connector = MockConnector::new();
        let mut config = fx.config(&[("s1", "10.0.0.1")], &[]);
        config.cluster.data_dir = "/data/k3s".to_string();
        config.cluster.registries = "mirrors:\n  docker.io: {}\n".to_string();
        config.assets.k3s_airgap_tarball = images.display().to_string();

        fx.installer(config, &connector).apply().unwrap();

        assert_eq!(
            connector.file("10.0.0.1", "/data/k3s/agent/images/k3s-airgap-images-amd64.tar.gz").unwrap(),
            b"images"
        );
        assert_eq!(
            connector.file_text("10.0.0.1", REGISTRIES_PATH).unwrap(),
            "mirrors:\n  docker.io: {}\n"
        );
        let script = connector.file_text("10.0.0.1", UNINSTALL_SCRIPT_PATH).unwrap();
        assert!(script.contains("DATA_DIR=/data/k3s\n"));
    }

    #[test]
    fn test_agents_join_primary_without_kubectl_link() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let config = fx.config(&[("s1", "10.0.0.1")], &[("w1", "10.0.1.1"), ("w2", "10.0.1.2")]);

        fx.installer(config, &connector).apply().unwrap();

        for host in ["10.0.1.1", "10.0.1.2"] {
            let worker = unit(&connector, host, Role::Worker);
            assert!(worker.contains("k3s agent --server https://10.0.0.1:6443"));
            assert!(!worker.contains("--cluster-init"));
            let commands = connector.commands(host);
            assert!(commands.contains(&"systemctl restart k3s-agent".to_string()));
            assert!(!commands.iter().any(|c| c.starts_with("ln -sf")));
            let script = connector.file_text(host, UNINSTALL_SCRIPT_PATH).unwrap();
            assert!(script.contains("SERVICE=k3s-agent\n"));
        }
        let hosts = connector.connected_hosts();
        assert_eq!(&hosts[..3], ["10.0.0.1", "10.0.1.1", "10.0.1.2"]);
    }

    #[test]
    fn test_parallel_agents() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let agents: Vec<(String, String)> = (1..=5)
            .map(|i| (format!("w{i}"), format!("10.0.1.{i}")))
            .collect();
        let agent_refs: Vec<(&str, &str)> = agents.iter().map(|(n, ip)| (n.as_str(), ip.as_str())).collect();
        let config = fx.config(&[("s1", "10.0.0.1")], &agent_refs);
        let mut options = fx.options();
        options.agent_parallelism = 3;

        fx.installer_with(config, options, &connector).apply().unwrap();

        for (_, ip) in &agents {
            assert!(connector.commands(ip).contains(&"systemctl restart k3s-agent".to_string()));
        }
        // The primary is always finished before any agent starts
        assert_eq!(connector.connected_hosts()[0], "10.0.0.1");
    }

    #[test]
    fn test_parallel_agent_failure_keeps_node_identity() {
        let fx = Fixture::new();
        let connector = MockConnector::new().fail_command("10.0.1.2", "systemctl enable k3s-agent");
        let config = fx.config(&[("s1", "10.0.0.1")], &[("w1", "10.0.1.1"), ("w2", "10.0.1.2"), ("w3", "10.0.1.3")]);
        let mut options = fx.options();
        options.agent_parallelism = 2;

        let err = fx.installer_with(config, options, &connector).apply().unwrap_err();
        match err {
            Error::Node { node, stage, .. } => {
                assert_eq!(node, "w2");
                assert_eq!(stage, NodeStage::Starting);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_kubeconfig_patched_and_saved() {
        let fx = Fixture::new();
        let connector = MockConnector::new().with_file(
            "10.0.0.1",
            "/var/lib/rancher/k3s/server/cred/k3s.yaml",
            KUBECONFIG.as_bytes(),
        );
        let config = fx.config(&[("s1", "10.0.0.1")], &[]);
        let options = fx.options();
        let path = options.kubeconfig_path.clone();

        fx.installer_with(config, options, &connector).apply().unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("server: https://10.0.0.1:6443"));
        assert!(!saved.contains("127.0.0.1"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_kubeconfig_is_not_fatal() {
        let fx = Fixture::new();
        let connector = MockConnector::new();
        let config = fx.config(&[("s1", "10.0.0.1")], &[]);
        let options = fx.options();
        let path = options.kubeconfig_path.clone();

        fx.installer_with(config, options, &connector).apply().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(NodeStage::UploadingAssets.to_string(), "uploading assets");
        let err = Error::Node {
            node: "s2".to_string(),
            stage: NodeStage::Starting,
            source: Box::new(Error::NoServers),
        };
        assert_eq!(err.to_string(), "node s2 failed while starting service");
    }
}
