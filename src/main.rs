mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    agent::AgentArgs,
    command::CommandCommands,
    device::DeviceCommands,
    org::OrgCommands,
    session::SessionCommands,
    start::StartArgs,
    user::UserCommands,
};

#[derive(Parser)]
#[command(author, version, about = "FleetDBX device fleet server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/fleetdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the FleetDBX server in the foreground
    Start(StartArgs),
    /// Run the reporting agent loop
    Agent(AgentArgs),
    /// Manage organizations
    Org {
        #[command(subcommand)]
        command: OrgCommands,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Issue operator session tokens
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Inspect and reassign devices
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
    /// Enqueue and inspect commands
    Command {
        #[command(subcommand)]
        command: CommandCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => commands::start::execute(config, args).await?,
        Commands::Agent(args) => commands::agent::execute(config, args).await?,
        Commands::Org { command } => commands::org::execute(config, command)?,
        Commands::User { command } => commands::user::execute(config, command)?,
        Commands::Session { command } => commands::session::execute(config, command)?,
        Commands::Device { command } => commands::device::execute(config, command)?,
        Commands::Command { command } => commands::command::execute(config, command)?,
    }

    Ok(())
}
