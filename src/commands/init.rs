//! `init`: write a starter cluster declaration

use crate::config::INIT_TEMPLATE;
use crate::services::k3s::generate_cluster_token;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Output path
    #[arg(long, short = 'o', default_value = "init.yaml")]
    pub output: PathBuf,
    /// Cluster join token (generated if not provided)
    #[arg(long)]
    pub token: Option<String>,
}

/// Starter config text with `token` filled in
pub fn render_init_config(token: &str) -> String {
    INIT_TEMPLATE.replace("__TOKEN__", token)
}

pub fn run(args: InitArgs) -> Result<()> {
    let token = args.token.unwrap_or_else(generate_cluster_token);
    let content = render_init_config(&token);

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&args.output)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            bail!("{} already exists, refusing to overwrite", args.output.display());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create {}", args.output.display()));
        }
    };
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!("✓ Wrote {}", args.output.display());
    println!();
    println!("Edit the node list and credentials, then run:");
    println!("  k3lift apply -f {}", args.output.display());
    Ok(())
}
