//! Purging of long-finished commands.
//!
//! Terminal records are never mutated again, so deleting them only loses
//! history. `claim` never looks at them either way.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::command_store::{CommandStore, CommandStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Terminal commands last updated longer ago than this are removed.
    pub horizon: Duration,
}

impl RetentionPolicy {
    pub fn new(horizon: Duration) -> Self {
        Self { horizon }
    }

    /// Remove terminal commands last touched before `now - horizon`.
    pub fn sweep<S: CommandStore + ?Sized>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<usize, CommandStoreError> {
        let horizon = chrono::Duration::from_std(self.horizon)
            .ok()
            .and_then(|h| now.checked_sub_signed(h))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = store.remove_terminal_before(horizon)?;
        if removed > 0 {
            info!(removed, %horizon, "purged terminal commands");
        }
        Ok(removed)
    }
}
