// Command module routing
//
// To add a new command:
// 1. Create a new file in this directory (e.g., `mycommand.rs`)
// 2. Add `pub mod mycommand;` below
// 3. Add the variant to `Commands` and the match arm in `handle_command`

pub mod apply;
pub mod init;

use anyhow::Result;
use clap::Subcommand;
use tracing::Dispatch;

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Install or update the cluster described in a config file
    Apply(apply::ApplyArgs),
    /// Write a starter init.yaml with a freshly generated token
    Init(init::InitArgs),
}

/// Dispatch command to appropriate handler
pub fn handle_command(command: Commands, dispatch: Dispatch) -> Result<()> {
    match command {
        Commands::Apply(args) => apply::run(args, dispatch),
        Commands::Init(args) => init::run(args),
    }
}
