use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use serde_json::Value;

use fleetdbx::config::load_or_default;

use crate::commands::open_store;

#[derive(Subcommand)]
pub enum CommandCommands {
    /// Queue a command for a device
    Enqueue {
        device_id: String,

        /// Command name
        name: String,

        /// Organization name the command is scoped to
        #[arg(long)]
        org: String,

        /// Command arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// List a device's commands and their results
    List {
        device_id: String,

        /// Organization name
        #[arg(long)]
        org: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: CommandCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = open_store(&config)?;

    match command {
        CommandCommands::Enqueue {
            device_id,
            name,
            org,
            args,
        } => {
            let org = store.org_by_name(&org)?;
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw).context("--args must be valid JSON")?,
                None => Value::Object(Default::default()),
            };
            let queued = store.enqueue_command(&device_id, org.id, &name, args, Utc::now())?;
            println!("command={} id={} status=pending", queued.name, queued.id);
        }
        CommandCommands::List { device_id, org } => {
            let org = store.org_by_name(&org)?;
            for command in store.list_commands(&device_id, org.id)? {
                println!(
                    "id={} name={} status={} created_at={} success={} message={}",
                    command.id,
                    command.name,
                    command.status.as_str(),
                    command.created_at.to_rfc3339(),
                    command
                        .success
                        .map(|value| value.to_string())
                        .unwrap_or_else(|| "-".into()),
                    command.message.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
