//! `locks`: inspect and recover writer locks

use anyhow::Result;

use super::CommandContext;
use crate::infrastructure::lock_coordinator::LockRecord;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum LocksCommand {
    /// Show every lock row
    List,
    /// Clear a lock regardless of its holder
    Release {
        /// Resource name, e.g. `persons`
        resource: String,
    },
}

pub async fn list_locks(ctx: &CommandContext) -> Result<Vec<LockRecord>> {
    Ok(ctx.lock_coordinator().list().await?)
}

/// Returns whether the lock was held before the release.
pub async fn release_lock(ctx: &CommandContext, resource: &str) -> Result<bool> {
    Ok(ctx.lock_coordinator().force_release(resource).await?)
}
