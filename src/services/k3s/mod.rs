//! K3s cluster installation service
//!
//! Handles service unit generation, per-node provisioning and kubeconfig retrieval.

mod install;
pub mod kubeconfig;
pub mod units;
mod utils;

pub use install::{InstallOptions, Installer, NodeStage};
pub use units::Role;
pub use utils::generate_cluster_token;
