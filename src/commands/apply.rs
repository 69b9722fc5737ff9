//! `apply`: bring the declared cluster up

use crate::config::Config;
use crate::services::k3s::{InstallOptions, Installer};
use crate::utils::ssh::{HostKeyVerifier, InsecureAcceptAny, KnownHostsFile, SshConnector};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Dispatch;

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    /// Cluster declaration
    #[arg(long, short = 'f', default_value = "init.yaml")]
    pub file: PathBuf,
    /// Directory searched for relative asset paths
    #[arg(long, default_value = "assets")]
    pub assets_dir: PathBuf,
    /// Seconds to wait after starting k3s on each node
    #[arg(long, default_value_t = 2)]
    pub settle_secs: u64,
    /// Number of agents installed at the same time
    #[arg(long, default_value_t = 1)]
    pub parallel: usize,
    /// Verify host keys against this known_hosts file (host keys are NOT verified without it)
    #[arg(long)]
    pub known_hosts: Option<String>,
    /// Where to write the cluster kubeconfig
    #[arg(long, default_value = "kubeconfig")]
    pub kubeconfig: PathBuf,
}

impl ApplyArgs {
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            assets_dir: self.assets_dir.clone(),
            settle_delay: Duration::from_secs(self.settle_secs),
            agent_parallelism: self.parallel.max(1),
            kubeconfig_path: self.kubeconfig.clone(),
        }
    }

    pub fn host_key_verifier(&self) -> Arc<dyn HostKeyVerifier> {
        match &self.known_hosts {
            Some(path) => Arc::new(KnownHostsFile::new(shellexpand::tilde(path).into_owned())),
            None => Arc::new(InsecureAcceptAny),
        }
    }
}

pub fn run(args: ApplyArgs, dispatch: Dispatch) -> Result<()> {
    let config = Config::load(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;

    let connector = SshConnector::new(args.host_key_verifier());
    tracing::dispatcher::with_default(&dispatch, || {
        if args.known_hosts.is_some() {
            tracing::info!(policy = %connector.host_key_policy(), "host key verification");
        } else {
            tracing::warn!(policy = %connector.host_key_policy(), "host keys are not verified; use --known-hosts outside trusted networks");
        }
    });

    let installer = Installer::new(config, args.install_options(), Box::new(connector), dispatch)
        .context("failed to prepare installation")?;
    installer.apply().context("installation failed")?;
    Ok(())
}
