//! Air-gapped K3s cluster bring-up over SSH
//!
//! A cluster declaration (`init.yaml`) lists servers and agents. `apply`
//! uploads the k3s binary and optional image bundle to every node, installs a
//! systemd unit for its role and starts it, then fetches a kubeconfig from the
//! first server.

pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use services::k3s::{InstallOptions, Installer, NodeStage};
