use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use fleetdbx::config::{generate_token, load_or_default};

use crate::commands::open_store;

const ORG_TOKEN_LEN: usize = 32;

#[derive(Subcommand)]
pub enum OrgCommands {
    /// Create an organization with a freshly generated API token
    Create {
        name: String,
    },
    /// List organizations
    List,
    /// Replace an organization's API token, invalidating the previous one
    RotateToken {
        name: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: OrgCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = open_store(&config)?;

    match command {
        OrgCommands::Create { name } => {
            let org = store.create_org(&name, &generate_token(ORG_TOKEN_LEN))?;
            println!("org={} id={} token={}", org.name, org.id, org.api_token);
        }
        OrgCommands::List => {
            for org in store.list_orgs()? {
                println!(
                    "org={} id={} token={} created_at={}",
                    org.name,
                    org.id,
                    org.api_token,
                    org.created_at.to_rfc3339()
                );
            }
        }
        OrgCommands::RotateToken { name } => {
            let org = store.rotate_org_token(&name, &generate_token(ORG_TOKEN_LEN))?;
            println!("org={} token={}", org.name, org.api_token);
        }
    }

    Ok(())
}
