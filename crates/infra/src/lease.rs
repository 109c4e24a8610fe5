//! Lease arithmetic and expiry evaluation. Holds no state of its own.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use cmdlease_core::{CommandError, CommandRecord, CommandStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("invalid lease duration {requested:?}: {reason}")]
    InvalidLeaseDuration { requested: Duration, reason: String },
}

impl From<LeaseError> for CommandError {
    fn from(value: LeaseError) -> Self {
        match value {
            LeaseError::InvalidLeaseDuration { requested, reason } => {
                CommandError::InvalidLeaseDuration { requested, reason }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseManager {
    max_lease: Option<Duration>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject lease durations longer than `max`.
    pub fn with_max_lease(mut self, max: Duration) -> Self {
        self.max_lease = Some(max);
        self
    }

    pub fn max_lease(&self) -> Option<Duration> {
        self.max_lease
    }

    /// `now + lease_duration`. The duration must be positive, within the cap
    /// and representable as a timestamp offset.
    pub fn compute_expiry(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<DateTime<Utc>, LeaseError> {
        let invalid = |reason: &str| LeaseError::InvalidLeaseDuration {
            requested: lease_duration,
            reason: reason.to_string(),
        };

        if lease_duration.is_zero() {
            return Err(invalid("must be positive"));
        }
        if let Some(max) = self.max_lease {
            if lease_duration > max {
                return Err(invalid(&format!("exceeds maximum of {max:?}")));
            }
        }

        let delta = chrono::Duration::from_std(lease_duration).map_err(|_| invalid("out of range"))?;
        now.checked_add_signed(delta)
            .ok_or_else(|| invalid("expiry overflows timestamp range"))
    }

    /// True iff the command is claimed and `now` is at or past its expiry.
    pub fn is_expired(&self, command: &CommandRecord, now: DateTime<Utc>) -> bool {
        command.lease().is_some_and(|lease| lease.is_expired(now))
    }

    /// Claimable right now: `Pending`, or `Claimed` with an expired lease.
    pub fn is_eligible(&self, command: &CommandRecord, now: DateTime<Utc>) -> bool {
        match &command.status {
            CommandStatus::Pending => true,
            CommandStatus::Claimed(lease) => lease.is_expired(now),
            CommandStatus::Completed | CommandStatus::Failed => false,
        }
    }
}
