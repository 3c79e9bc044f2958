use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use fleetdbx::{config::load_or_default, server};

#[derive(Args)]
pub struct StartArgs {
    /// Override the configured server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    server::run(config).await?;
    Ok(())
}
