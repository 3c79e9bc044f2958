use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use fleetdbx::{agent, config::load_or_default};

#[derive(Args)]
pub struct AgentArgs {
    /// Override the configured server URL
    #[arg(long)]
    pub server_url: Option<String>,

    /// Override the configured device identifier
    #[arg(long)]
    pub device_id: Option<String>,

    /// Override the configured organization token
    #[arg(long)]
    pub org_token: Option<String>,

    /// Override the telemetry report interval in seconds
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Override the command poll interval in seconds
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
}

pub async fn execute(config_path: Option<PathBuf>, args: AgentArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let mut agent_config = config.agent;
    if let Some(server_url) = args.server_url {
        agent_config.server_url = server_url;
    }
    if let Some(device_id) = args.device_id {
        agent_config.device_id = device_id;
    }
    if let Some(org_token) = args.org_token {
        agent_config.org_token = Some(org_token);
    }
    if let Some(interval) = args.interval_secs {
        agent_config.interval_secs = interval;
    }
    if let Some(poll_interval) = args.poll_interval_secs {
        agent_config.poll_interval_secs = poll_interval;
    }
    agent::run(agent_config).await?;
    Ok(())
}
