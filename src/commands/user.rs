use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use fleetdbx::config::load_or_default;

use crate::commands::open_store;

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user bound to an organization
    Create {
        name: String,

        /// Organization name the user belongs to
        #[arg(long)]
        org: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: UserCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = open_store(&config)?;

    match command {
        UserCommands::Create { name, org } => {
            let org = store.org_by_name(&org)?;
            let user = store.create_user(&name, org.id)?;
            println!("user={} id={} org={}", user.name, user.id, org.name);
        }
    }

    Ok(())
}
