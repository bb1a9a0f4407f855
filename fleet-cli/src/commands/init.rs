//! `fleet init`

use anyhow::{Context, Result};
use clap::Args;

use fleet_core::{FileStore, ObjectStore};

use super::home_dir;

/// Create the fleet store under ~/.fleet.
#[derive(Args, Debug)]
pub struct InitArgs {}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let store = FileStore::init_at(&home).context("failed to initialise fleet store")?;
        let objects = store
            .list_newest_objects()
            .context("failed to read fleet store")?;

        println!("✓ Fleet store ready with {} object(s)", objects.len());
        println!("  Location: {}", fleet_core::store::fleet_root(&home).display());
        Ok(())
    }
}
