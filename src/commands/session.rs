use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use fleetdbx::{config::load_or_default, token::SessionKeys};

use crate::commands::open_store;

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Issue a signed session token for a user
    Issue {
        /// User the session is issued to
        #[arg(long)]
        user: String,

        /// Session lifetime in seconds; defaults to the configured TTL
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: SessionCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = open_store(&config)?;

    match command {
        SessionCommands::Issue { user, ttl_secs } => {
            let user = store.user_by_name(&user)?;
            let keys = SessionKeys::new(config.session_secret()?);
            let ttl = ttl_secs.unwrap_or(config.session_ttl_secs);
            let token = keys.issue(&user.name, user.org_id, ttl)?;
            println!("token={token}");
        }
    }

    Ok(())
}
