use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;

use fleetdbx::config::load_or_default;

use crate::commands::open_store;

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// List an organization's devices with liveness
    List {
        /// Organization name
        #[arg(long)]
        org: String,
    },
    /// Transfer a device to another organization
    Reassign {
        device_id: String,

        /// Organization name taking ownership
        #[arg(long)]
        org: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: DeviceCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = open_store(&config)?;

    match command {
        DeviceCommands::List { org } => {
            let org = store.org_by_name(&org)?;
            for device in store.list_devices(org.id, Utc::now())? {
                println!(
                    "device={} hostname={} online={} last_seen={}",
                    device.device_id,
                    device.hostname,
                    device.online,
                    device.last_seen.to_rfc3339()
                );
            }
        }
        DeviceCommands::Reassign { device_id, org } => {
            let org = store.org_by_name(&org)?;
            store.reassign_device(&device_id, org.id)?;
            println!("device={device_id} org={}", org.name);
        }
    }

    Ok(())
}
