//! Lease-based command dispatch (application-level orchestration).
//!
//! Producers `submit` commands; consumers `claim` one, work on it while
//! holding a time-bounded lease, then `complete`, `fail` or `release` it.
//!
//! ```text
//! claim(consumer, type_filter, lease, now)
//!   ↓
//! 1. Scan Pending/Claimed candidates (oldest first, id tie-break)
//!   ↓
//! 2. Keep the eligible ones (Pending, or Claimed with an expired lease)
//!   ↓
//! 3. compare_and_transition(candidate, its (state, attempt), Claim)
//!   ↓ lost the race?
//! 4. Drop that candidate and go back to 1, at most `max_claim_attempts` times
//! ```
//!
//! Every mutation goes through [`CommandStore::compare_and_transition`]; the
//! service holds no locks of its own and never reads a clock. Callers pass
//! `now` so lease expiry is deterministic under test.
//!
//! Store errors never escape raw: `ConflictingState`/`IllegalTransition`
//! become `LeaseConflict`, `NotFound` becomes `CommandNotFound`, and only a
//! backend fault surfaces as `Unavailable`. `complete`/`fail`/`release`/`renew`
//! are never retried here, since a retry with a stale attempt is exactly what
//! the attempt token exists to reject.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use cmdlease_core::{
    ClaimedCommand, CommandError, CommandId, CommandRecord, CommandResult, CommandState,
    CommandView, ConflictReason, ConsumerId, StateVersion, Transition,
};

use crate::command_store::{CommandFilter, CommandStore, CommandStoreError};
use crate::config::{ConfigError, ServiceConfig};
use crate::lease::LeaseManager;
use crate::registry::TypeRegistry;

/// `submit` regenerates the id this many times on a duplicate before giving up.
const MAX_ID_COLLISIONS: usize = 3;

/// Per-state counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claimed commands whose lease has run out (claimable again).
    pub expired_claims: usize,
}

pub struct CommandService<S> {
    store: S,
    registry: TypeRegistry,
    leases: LeaseManager,
    config: ServiceConfig,
}

impl<S: core::fmt::Debug> core::fmt::Debug for CommandService<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandService")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl<S> CommandService<S> {
    /// Service with default configuration.
    pub fn new(store: S, registry: TypeRegistry) -> Self {
        Self {
            store,
            registry,
            leases: LeaseManager::new(),
            config: ServiceConfig::default(),
        }
    }

    pub fn with_config(
        store: S,
        registry: TypeRegistry,
        config: ServiceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut leases = LeaseManager::new();
        if let Some(max) = config.max_lease {
            leases = leases.with_max_lease(max);
        }
        Ok(Self {
            store,
            registry,
            leases,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn into_parts(self) -> (S, TypeRegistry) {
        (self.store, self.registry)
    }
}

impl<S> CommandService<S>
where
    S: CommandStore,
{
    /// Validate and enqueue a command as `Pending` with `attempt = 0`.
    pub fn submit(
        &self,
        command_type: &str,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> CommandResult<CommandId> {
        self.registry.validate(command_type, &payload)?;

        let mut record = CommandRecord::new(CommandId::new(), command_type, payload, now);
        for _ in 0..MAX_ID_COLLISIONS {
            match self.store.put(record.clone()) {
                Ok(()) => {
                    debug!(command_id = %record.id, command_type, "command submitted");
                    return Ok(record.id);
                }
                Err(CommandStoreError::DuplicateId(id)) => {
                    warn!(command_id = %id, "id collision on submit; regenerating");
                    record.id = CommandId::new();
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
        Err(CommandError::Unavailable(format!(
            "could not allocate a unique command id after {MAX_ID_COLLISIONS} attempts"
        )))
    }

    pub fn get(&self, id: CommandId) -> CommandResult<CommandView> {
        self.load(id).map(CommandView::from)
    }

    /// Claim the oldest eligible command, optionally restricted to one type.
    ///
    /// Never blocks: with nothing eligible it fails with `CommandNotFound`
    /// and the caller decides how to back off.
    pub fn claim(
        &self,
        consumer: &ConsumerId,
        type_filter: Option<&str>,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> CommandResult<ClaimedCommand> {
        let expires_at = self.leases.compute_expiry(now, lease_duration)?;
        let filter = CommandFilter::in_states([CommandState::Pending, CommandState::Claimed])
            .with_type_opt(type_filter);

        let mut lost: HashSet<CommandId> = HashSet::new();
        let mut last_conflict = None;

        for round in 1..=self.config.max_claim_attempts {
            let candidates = self.store.scan(&filter).map_err(unavailable)?;
            let Some(candidate) = candidates
                .iter()
                .find(|r| !lost.contains(&r.id) && self.leases.is_eligible(r, now))
            else {
                return Err(CommandError::nothing_to_claim(type_filter));
            };

            let expected = candidate.version();
            let transition = Transition::Claim {
                owner: consumer.clone(),
                expires_at,
            };

            match self
                .store
                .compare_and_transition(candidate.id, expected, transition, now)
            {
                Ok(record) => {
                    let reclaimed = expected.state == CommandState::Claimed;
                    debug!(
                        command_id = %record.id,
                        consumer = %consumer,
                        attempt = record.attempt,
                        reclaimed,
                        %expires_at,
                        "command claimed"
                    );
                    return ClaimedCommand::from_record(&record).ok_or_else(|| {
                        CommandError::Unavailable(format!(
                            "store returned {} for a successful claim of {}",
                            record.version(),
                            record.id
                        ))
                    });
                }
                Err(
                    CommandStoreError::ConflictingState { id, actual, .. }
                    | CommandStoreError::IllegalTransition {
                        id, from: actual, ..
                    },
                ) => {
                    let retry_same = self.still_eligible(id, actual, now);
                    debug!(
                        command_id = %id,
                        consumer = %consumer,
                        round,
                        %expected,
                        %actual,
                        retry_same,
                        "lost claim race"
                    );
                    // A sweep or the old owner's release only moved it back
                    // to Pending; it stays a candidate.
                    if !retry_same {
                        lost.insert(id);
                    }
                    last_conflict = Some((id, expected, actual));
                }
                // Removed between scan and transition.
                Err(CommandStoreError::NotFound(id)) => {
                    lost.insert(id);
                }
                Err(e) => return Err(unavailable(e)),
            }
        }

        match last_conflict {
            Some((id, expected, actual)) => {
                warn!(
                    consumer = %consumer,
                    attempts = self.config.max_claim_attempts,
                    "claim retries exhausted"
                );
                Err(CommandError::conflict(
                    id,
                    ConflictReason::ClaimRetriesExhausted,
                    expected,
                    actual,
                ))
            }
            None => Err(CommandError::nothing_to_claim(type_filter)),
        }
    }

    /// `Claimed → Completed`, gated on owner and attempt.
    pub fn complete(
        &self,
        id: CommandId,
        consumer: &ConsumerId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> CommandResult<CommandView> {
        self.gated(id, consumer, attempt, Transition::Complete, now)
    }

    /// Permanent failure → `Failed`; transient → back to `Pending` for
    /// redelivery. Same ownership/attempt check as `complete`.
    pub fn fail(
        &self,
        id: CommandId,
        consumer: &ConsumerId,
        attempt: u32,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> CommandResult<CommandView> {
        let transition = if permanent {
            Transition::Fail
        } else {
            Transition::Release
        };
        self.gated(id, consumer, attempt, transition, now)
    }

    /// Early hand-back of a claim (graceful consumer shutdown).
    pub fn release(
        &self,
        id: CommandId,
        consumer: &ConsumerId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> CommandResult<CommandView> {
        self.gated(id, consumer, attempt, Transition::Release, now)
    }

    /// Extend a held lease to `now + lease_duration`. `attempt` is unchanged.
    pub fn renew(
        &self,
        id: CommandId,
        consumer: &ConsumerId,
        attempt: u32,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> CommandResult<ClaimedCommand> {
        let expires_at = self.leases.compute_expiry(now, lease_duration)?;
        let view = self.gated(id, consumer, attempt, Transition::Renew { expires_at }, now)?;
        match (view.lease_owner, view.lease_expires_at) {
            (Some(lease_owner), Some(lease_expires_at)) => Ok(ClaimedCommand {
                id: view.id,
                command_type: view.command_type,
                payload: view.payload,
                attempt: view.attempt,
                lease_owner,
                lease_expires_at,
            }),
            _ => Err(CommandError::Unavailable(format!(
                "store returned {} for a successful renew of {id}",
                view.state
            ))),
        }
    }

    /// Return every expired claim to `Pending`. Returns how many moved.
    ///
    /// Optional housekeeping: `claim` already treats expired claims as
    /// eligible. Claims that change under the sweep are skipped.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> CommandResult<usize> {
        let claimed = self
            .store
            .scan(&CommandFilter::in_states([CommandState::Claimed]))
            .map_err(unavailable)?;

        let mut expired = 0;
        for record in claimed.iter().filter(|r| self.leases.is_expired(r, now)) {
            match self
                .store
                .compare_and_transition(record.id, record.version(), Transition::Expire, now)
            {
                Ok(_) => {
                    debug!(command_id = %record.id, attempt = record.attempt, "lease expired");
                    expired += 1;
                }
                Err(
                    CommandStoreError::ConflictingState { .. }
                    | CommandStoreError::IllegalTransition { .. }
                    | CommandStoreError::NotFound(_),
                ) => {}
                Err(e) => return Err(unavailable(e)),
            }
        }
        Ok(expired)
    }

    pub fn list(&self, filter: &CommandFilter) -> CommandResult<Vec<CommandView>> {
        Ok(self
            .store
            .scan(filter)
            .map_err(unavailable)?
            .iter()
            .map(CommandView::from)
            .collect())
    }

    pub fn stats(&self, now: DateTime<Utc>) -> CommandResult<CommandStats> {
        let records = self.store.scan(&CommandFilter::all()).map_err(unavailable)?;
        let mut stats = CommandStats::default();
        for record in &records {
            match record.state() {
                CommandState::Pending => stats.pending += 1,
                CommandState::Claimed => {
                    stats.claimed += 1;
                    if self.leases.is_expired(record, now) {
                        stats.expired_claims += 1;
                    }
                }
                CommandState::Completed => stats.completed += 1,
                CommandState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Whether a record whose claim CAS just failed can still be claimed.
    fn still_eligible(&self, id: CommandId, actual: StateVersion, now: DateTime<Utc>) -> bool {
        match actual.state {
            CommandState::Pending => true,
            CommandState::Claimed => self
                .store
                .get(id)
                .is_ok_and(|r| self.leases.is_eligible(&r, now)),
            CommandState::Completed | CommandState::Failed => false,
        }
    }

    fn load(&self, id: CommandId) -> CommandResult<CommandRecord> {
        self.store.get(id).map_err(|e| match e {
            CommandStoreError::NotFound(id) => CommandError::not_found(id),
            other => unavailable(other),
        })
    }

    /// Apply a lease-holder transition after checking the caller still owns
    /// the lease identified by `attempt`.
    fn gated(
        &self,
        id: CommandId,
        consumer: &ConsumerId,
        attempt: u32,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> CommandResult<CommandView> {
        let record = self.load(id)?;
        let expected = StateVersion::new(CommandState::Claimed, attempt);
        let actual = record.version();

        let reason = if actual.state.is_terminal() {
            Some(ConflictReason::Terminal)
        } else if actual.state != CommandState::Claimed {
            Some(ConflictReason::NotClaimed)
        } else if actual.attempt != attempt {
            Some(ConflictReason::StaleAttempt)
        } else if record.lease().is_some_and(|l| &l.owner != consumer) {
            Some(ConflictReason::WrongOwner)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(command_id = %id, consumer = %consumer, %reason, %expected, %actual, transition = transition.name(), "transition rejected");
            return Err(CommandError::conflict(id, reason, expected, actual));
        }

        // The attempt names exactly one lease, so (Claimed, attempt) pins the
        // owner checked above.
        let name = transition.name();
        match self
            .store
            .compare_and_transition(id, expected, transition, now)
        {
            Ok(record) => {
                debug!(command_id = %id, consumer = %consumer, attempt, transition = name, state = %record.state(), "transition applied");
                Ok(CommandView::from(&record))
            }
            Err(
                CommandStoreError::ConflictingState { actual, .. }
                | CommandStoreError::IllegalTransition { from: actual, .. },
            ) => Err(CommandError::conflict(
                id,
                ConflictReason::LostRace,
                expected,
                actual,
            )),
            Err(CommandStoreError::NotFound(id)) => Err(CommandError::not_found(id)),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(e: CommandStoreError) -> CommandError {
    CommandError::Unavailable(e.to_string())
}
