//! Command error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::command::StateVersion;
use crate::id::CommandId;

/// Result type used by command operations.
pub type CommandResult<T> = Result<T, CommandError>;

/// What a "not found" refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// No record exists for this id.
    Id(CommandId),
    /// Nothing was eligible to claim.
    NoEligible { type_filter: Option<String> },
}

impl core::fmt::Display for NotFound {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NotFound::Id(id) => write!(f, "no command with id {id}"),
            NotFound::NoEligible { type_filter: None } => f.write_str("no eligible command"),
            NotFound::NoEligible {
                type_filter: Some(t),
            } => write!(f, "no eligible command of type '{t}'"),
        }
    }
}

/// Why a gated transition was rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The caller's attempt token is not the current one.
    StaleAttempt,
    /// The lease belongs to a different consumer.
    WrongOwner,
    /// The command is not currently claimed.
    NotClaimed,
    /// The command already reached `Completed` or `Failed`.
    Terminal,
    /// Another caller moved the record between read and write.
    LostRace,
    /// `claim` lost every race it was allowed to retry.
    ClaimRetriesExhausted,
}

impl core::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ConflictReason::StaleAttempt => "stale attempt",
            ConflictReason::WrongOwner => "wrong lease owner",
            ConflictReason::NotClaimed => "not claimed",
            ConflictReason::Terminal => "command is terminal",
            ConflictReason::LostRace => "lost race",
            ConflictReason::ClaimRetriesExhausted => "claim retries exhausted",
        };
        f.write_str(s)
    }
}

/// Failure signals returned by the command service.
///
/// Every variant carries enough structure to decide retry vs. abort without
/// parsing the message: see [`CommandError::is_retryable`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No record for the id, or nothing eligible to claim.
    #[error("command not found: {0}")]
    CommandNotFound(NotFound),

    /// A gated transition was rejected because `(state, attempt)` or the
    /// owner no longer matched.
    #[error("lease conflict on {id}: {reason} (expected {expected}, actual {actual})")]
    LeaseConflict {
        id: CommandId,
        reason: ConflictReason,
        expected: StateVersion,
        actual: StateVersion,
    },

    /// The command type is not registered.
    #[error("invalid command type: '{command_type}'")]
    InvalidCommandType { command_type: String },

    /// The payload failed the non-empty check or the type's validator.
    #[error("invalid payload for '{command_type}': {reason}")]
    InvalidPayload {
        command_type: String,
        reason: String,
    },

    /// Lease duration was zero, above the configured cap, or out of range.
    #[error("invalid lease duration {requested:?}: {reason}")]
    InvalidLeaseDuration { requested: Duration, reason: String },

    /// The storage backend failed (not a conflict).
    #[error("command store unavailable: {0}")]
    Unavailable(String),
}

impl CommandError {
    pub fn not_found(id: CommandId) -> Self {
        Self::CommandNotFound(NotFound::Id(id))
    }

    pub fn nothing_to_claim(type_filter: Option<&str>) -> Self {
        Self::CommandNotFound(NotFound::NoEligible {
            type_filter: type_filter.map(str::to_string),
        })
    }

    pub fn conflict(
        id: CommandId,
        reason: ConflictReason,
        expected: StateVersion,
        actual: StateVersion,
    ) -> Self {
        Self::LeaseConflict {
            id,
            reason,
            expected,
            actual,
        }
    }

    /// Re-fetching state and trying again may succeed.
    ///
    /// Input errors (`CommandNotFound`, `InvalidCommandType`, `InvalidPayload`,
    /// `InvalidLeaseDuration`) are terminal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommandError::LeaseConflict { .. } | CommandError::Unavailable(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CommandError::LeaseConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandError::CommandNotFound(_))
    }
}
