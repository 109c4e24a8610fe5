use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use cmdlease_core::{CommandId, CommandRecord, CommandState, StateVersion, Transition};

/// Durable home for command records.
///
/// `compare_and_transition` is the single synchronization primitive every
/// higher-level operation is built on. Implementations must make it
/// linearizable per id: concurrent callers on one id observe a single order,
/// and callers on different ids never wait on each other.
///
/// Backends are free to be an in-memory table, an on-disk log or an external
/// KV store; only this contract matters to the command service.
pub trait CommandStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateId` if the id exists.
    fn put(&self, record: CommandRecord) -> Result<(), CommandStoreError>;

    /// Current record, or `NotFound`.
    fn get(&self, id: CommandId) -> Result<CommandRecord, CommandStoreError>;

    /// Atomically apply `transition` iff the stored `(state, attempt)` equals
    /// `expected` and the state machine allows it. Returns the updated record.
    ///
    /// On mismatch nothing is changed and `ConflictingState` reports what was
    /// actually stored.
    fn compare_and_transition(
        &self,
        id: CommandId,
        expected: StateVersion,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<CommandRecord, CommandStoreError>;

    /// Snapshot of matching records ordered by `(created_at, id)`.
    fn scan(&self, filter: &CommandFilter) -> Result<Vec<CommandRecord>, CommandStoreError>;

    /// Delete terminal records last updated before `horizon`. Returns how many
    /// were removed. Only retention policies call this.
    fn remove_terminal_before(&self, horizon: DateTime<Utc>) -> Result<usize, CommandStoreError>;
}

/// Command store operation error.
///
/// `DuplicateId`, `NotFound`, `ConflictingState` and `IllegalTransition` are
/// expected outcomes the command service translates; `Storage` is a backend
/// fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandStoreError {
    #[error("duplicate command id: {0}")]
    DuplicateId(CommandId),

    #[error("command not found: {0}")]
    NotFound(CommandId),

    #[error("conflicting state for {id}: expected {expected}, actual {actual}")]
    ConflictingState {
        id: CommandId,
        expected: StateVersion,
        actual: StateVersion,
    },

    #[error("illegal transition '{transition}' for {id} from {from}")]
    IllegalTransition {
        id: CommandId,
        from: StateVersion,
        transition: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Selection criteria for [`CommandStore::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFilter {
    /// Empty means every state.
    pub states: Vec<CommandState>,
    pub command_type: Option<String>,
    pub limit: Option<usize>,
}

impl CommandFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(states: impl IntoIterator<Item = CommandState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, command_type: impl Into<String>) -> Self {
        self.command_type = Some(command_type.into());
        self
    }

    pub fn with_type_opt(mut self, command_type: Option<&str>) -> Self {
        self.command_type = command_type.map(str::to_string);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &CommandRecord) -> bool {
        (self.states.is_empty() || self.states.contains(&record.state()))
            && self
                .command_type
                .as_deref()
                .is_none_or(|t| t == record.command_type)
    }
}

impl<T: CommandStore + ?Sized> CommandStore for Arc<T> {
    fn put(&self, record: CommandRecord) -> Result<(), CommandStoreError> {
        (**self).put(record)
    }

    fn get(&self, id: CommandId) -> Result<CommandRecord, CommandStoreError> {
        (**self).get(id)
    }

    fn compare_and_transition(
        &self,
        id: CommandId,
        expected: StateVersion,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<CommandRecord, CommandStoreError> {
        (**self).compare_and_transition(id, expected, transition, at)
    }

    fn scan(&self, filter: &CommandFilter) -> Result<Vec<CommandRecord>, CommandStoreError> {
        (**self).scan(filter)
    }

    fn remove_terminal_before(&self, horizon: DateTime<Utc>) -> Result<usize, CommandStoreError> {
        (**self).remove_terminal_before(horizon)
    }
}
