use anyhow::Result;
use clap::Parser;
use k3lift::commands::{self, Commands};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(name = "k3lift")]
#[command(version)]
#[command(about = "Install an air-gapped K3s cluster over SSH", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Log sink handed to the installer; nothing is installed globally.
fn log_dispatch(verbose: bool) -> Dispatch {
    let filter = if verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(false)
        .finish();
    Dispatch::new(subscriber)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dispatch = log_dispatch(cli.verbose);
    commands::handle_command(cli.command, dispatch)
}
