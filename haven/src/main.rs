//! havend - Haven node daemon

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

use haven::{Node, NodeConfig};

#[derive(Debug, Parser)]
#[command(name = "havend", about = "Haven self-sovereign node kernel", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the env directory (salts, sealed seed, trust store).
    #[arg(long)]
    env_dir: Option<PathBuf>,

    /// Override the peer transport listener address.
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Override the loopback HTTP API address.
    #[arg(long)]
    http: Option<std::net::SocketAddr>,

    /// Override the tracing filter, e.g. `info,lib_network=debug`.
    #[arg(long)]
    log: Option<String>,

    /// File containing the owner password; `HAVEN_PASSWORD` otherwise.
    #[arg(long)]
    password_file: Option<PathBuf>,
}

fn resolve_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(env_dir) = &cli.env_dir {
        config.env_dir = env_dir.clone();
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(http) = cli.http {
        config.http_addr = http;
    }
    if let Some(log) = &cli.log {
        config.log_filter = log.clone();
    }
    Ok(config)
}

fn resolve_password(cli: &Cli) -> Result<String> {
    if let Some(path) = &cli.password_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading password file {}", path.display()))?;
        return Ok(raw.trim_end_matches(['\n', '\r']).to_string());
    }
    match std::env::var("HAVEN_PASSWORD") {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => bail!("no password: pass --password-file or set HAVEN_PASSWORD"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut password = match resolve_password(&cli) {
        Ok(password) => password,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    let node = match Node::build(config, &password).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {e:#}");
            password.zeroize();
            std::process::exit(1);
        }
    };
    password.zeroize();

    if let Some(mnemonic) = &node.mnemonic {
        // Shown exactly once; the seed on disk is sealed from here on.
        println!("recovery phrase (write this down, it will not be shown again):");
        println!("  {mnemonic}");
    }

    if let Err(e) = node.run().await {
        error!("node exited with error: {e:#}");
        std::process::exit(1);
    }
}
