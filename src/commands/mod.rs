pub mod agent;
pub mod command;
pub mod device;
pub mod org;
pub mod session;
pub mod start;
pub mod user;

use anyhow::Result;

use fleetdbx::{
    config::Config,
    store::{Store, StoreOptions},
};

/// Opens the store the way the server does, seeding the default organization
/// so admin commands work against a fresh data directory.
pub(crate) fn open_store(config: &Config) -> Result<Store> {
    config.ensure_data_dir()?;
    let store = Store::open(config.db_path(), StoreOptions::from(config))?;
    store.ensure_default_org(&config.default_org_name, config.default_org_token()?)?;
    Ok(store)
}
