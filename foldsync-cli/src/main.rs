use anyhow::{anyhow, Context, Result};
use clap::Parser;
use foldsync_core::{Config, PairManager};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foldsync", version, about = "foldsync – folder pair synchronisation daemon")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("foldsync=debug,foldsync_core=debug")
    } else {
        EnvFilter::new("foldsync=info,foldsync_core=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    if config.pairs.is_empty() {
        return Err(anyhow!("no pairs defined in {}", cli.config.display()));
    }

    info!(
        config = %cli.config.display(),
        listen = %config.listen,
        pairs = config.pairs.len(),
        "starting"
    );

    let manager = PairManager::new("")?;
    for pair in config.pairs {
        let id = pair.id.clone();
        if let Err(err) = manager.start_pair(pair).await {
            error!(pair = %id, error = %err, "failed to start pair");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.close().await;
    Ok(())
}
