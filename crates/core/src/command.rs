//! Command record and its lease state machine.
//!
//! ```text
//! Pending --claim--> Claimed --complete--> Completed   (terminal)
//!                    Claimed --fail(permanent)--> Failed (terminal)
//!                    Claimed --fail(transient) | release | expire--> Pending
//!                    Claimed --claim (lease expired)--> Claimed  (attempt + 1)
//!                    Claimed --renew--> Claimed  (same attempt)
//! ```
//!
//! Records are only mutated through [`CommandRecord::apply`], and stores only
//! call it after checking the caller's [`StateVersion`] expectation and
//! [`Transition::is_allowed_from`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{CommandId, ConsumerId};

/// Lifecycle state tag (no lease data).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Claimed => "claimed",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for CommandState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-bounded right to process a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: ConsumerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle state with its data. A lease exists only while `Claimed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Claimed(Lease),
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn state(&self) -> CommandState {
        match self {
            CommandStatus::Pending => CommandState::Pending,
            CommandStatus::Claimed(_) => CommandState::Claimed,
            CommandStatus::Completed => CommandState::Completed,
            CommandStatus::Failed => CommandState::Failed,
        }
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            CommandStatus::Claimed(lease) => Some(lease),
            _ => None,
        }
    }
}

/// Optimistic-concurrency token: the `(state, attempt)` pair a caller expects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateVersion {
    pub state: CommandState,
    pub attempt: u32,
}

impl StateVersion {
    pub fn new(state: CommandState, attempt: u32) -> Self {
        Self { state, attempt }
    }
}

impl core::fmt::Display for StateVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.state, self.attempt)
    }
}

/// The closed set of mutations a store may apply to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Take (or re-take after expiry) the lease. Increments `attempt`.
    Claim {
        owner: ConsumerId,
        expires_at: DateTime<Utc>,
    },
    /// Push the current lease's expiry out.
    Renew { expires_at: DateTime<Utc> },
    Complete,
    /// Permanent failure.
    Fail,
    /// Hand the command back (transient failure or graceful shutdown).
    Release,
    /// Lease ran out; return to `Pending`.
    Expire,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Renew { .. } => "renew",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Release => "release",
            Transition::Expire => "expire",
        }
    }

    /// Whether the state machine has an edge for this transition out of `from`.
    pub fn is_allowed_from(&self, from: CommandState) -> bool {
        match self {
            Transition::Claim { .. } => {
                matches!(from, CommandState::Pending | CommandState::Claimed)
            }
            Transition::Renew { .. }
            | Transition::Complete
            | Transition::Fail
            | Transition::Release
            | Transition::Expire => from == CommandState::Claimed,
        }
    }
}

/// A unit of work as held by a command store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub command_type: String,
    pub payload: JsonValue,
    pub status: CommandStatus,
    /// Incremented on every successful claim; never decreases.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    /// Create a `Pending` record with `attempt = 0`.
    pub fn new(
        id: CommandId,
        command_type: impl Into<String>,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            command_type: command_type.into(),
            payload,
            status: CommandStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> CommandState {
        self.status.state()
    }

    pub fn version(&self) -> StateVersion {
        StateVersion::new(self.state(), self.attempt)
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.status.lease()
    }

    /// Apply a transition. Callers must have checked
    /// [`Transition::is_allowed_from`] against the current state.
    pub fn apply(&mut self, transition: Transition, at: DateTime<Utc>) {
        match transition {
            Transition::Claim { owner, expires_at } => {
                self.attempt += 1;
                self.status = CommandStatus::Claimed(Lease { owner, expires_at });
            }
            Transition::Renew { expires_at } => {
                if let CommandStatus::Claimed(lease) = &mut self.status {
                    lease.expires_at = expires_at;
                }
            }
            Transition::Complete => self.status = CommandStatus::Completed,
            Transition::Fail => self.status = CommandStatus::Failed,
            Transition::Release | Transition::Expire => self.status = CommandStatus::Pending,
        }
        self.updated_at = at;
    }
}

/// Read-only projection of a command for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandView {
    pub id: CommandId,
    pub command_type: String,
    pub payload: JsonValue,
    pub state: CommandState,
    pub attempt: u32,
    pub lease_owner: Option<ConsumerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CommandRecord> for CommandView {
    fn from(record: &CommandRecord) -> Self {
        let lease = record.lease();
        Self {
            id: record.id,
            command_type: record.command_type.clone(),
            payload: record.payload.clone(),
            state: record.state(),
            attempt: record.attempt,
            lease_owner: lease.map(|l| l.owner.clone()),
            lease_expires_at: lease.map(|l| l.expires_at),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl From<CommandRecord> for CommandView {
    fn from(record: CommandRecord) -> Self {
        Self::from(&record)
    }
}

/// What a consumer receives from a successful claim (or renewal).
///
/// `attempt` is the token to hand back on `complete`/`fail`/`release`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedCommand {
    pub id: CommandId,
    pub command_type: String,
    pub payload: JsonValue,
    pub attempt: u32,
    pub lease_owner: ConsumerId,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedCommand {
    /// Build from a record in `Claimed` state; `None` otherwise.
    pub fn from_record(record: &CommandRecord) -> Option<Self> {
        let lease = record.lease()?;
        Some(Self {
            id: record.id,
            command_type: record.command_type.clone(),
            payload: record.payload.clone(),
            attempt: record.attempt,
            lease_owner: lease.owner.clone(),
            lease_expires_at: lease.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn record() -> CommandRecord {
        CommandRecord::new(CommandId::new(), "echo", serde_json::json!("hi"), t(0))
    }

    #[test]
    fn new_record_is_pending_with_zero_attempt() {
        let r = record();
        assert_eq!(r.version(), StateVersion::new(CommandState::Pending, 0));
        assert!(r.lease().is_none());
    }

    #[test]
    fn claim_sets_lease_and_bumps_attempt() {
        let mut r = record();
        r.apply(
            Transition::Claim {
                owner: ConsumerId::new("w1").unwrap(),
                expires_at: t(10),
            },
            t(0),
        );
        assert_eq!(r.state(), CommandState::Claimed);
        assert_eq!(r.attempt, 1);
        let lease = r.lease().unwrap();
        assert_eq!(lease.owner.as_str(), "w1");
        assert!(!lease.is_expired(t(9)));
        assert!(lease.is_expired(t(10)));
    }

    #[test]
    fn release_clears_lease_but_keeps_attempt() {
        let mut r = record();
        r.apply(
            Transition::Claim {
                owner: ConsumerId::new("w1").unwrap(),
                expires_at: t(10),
            },
            t(0),
        );
        r.apply(Transition::Release, t(3));
        assert_eq!(r.version(), StateVersion::new(CommandState::Pending, 1));
        assert!(r.lease().is_none());
        assert_eq!(r.updated_at, t(3));
    }

    #[test]
    fn renew_moves_expiry_only() {
        let mut r = record();
        r.apply(
            Transition::Claim {
                owner: ConsumerId::new("w1").unwrap(),
                expires_at: t(10),
            },
            t(0),
        );
        r.apply(
            Transition::Renew {
                expires_at: t(0) + Duration::seconds(25),
            },
            t(5),
        );
        assert_eq!(r.attempt, 1);
        assert_eq!(r.lease().unwrap().expires_at, t(25));
    }

    #[test]
    fn terminal_states_allow_nothing() {
        let transitions = [
            Transition::Claim {
                owner: ConsumerId::new("w1").unwrap(),
                expires_at: t(1),
            },
            Transition::Renew { expires_at: t(1) },
            Transition::Complete,
            Transition::Fail,
            Transition::Release,
            Transition::Expire,
        ];
        for tr in &transitions {
            assert!(!tr.is_allowed_from(CommandState::Completed), "{}", tr.name());
            assert!(!tr.is_allowed_from(CommandState::Failed), "{}", tr.name());
        }
    }

    #[test]
    fn only_claim_leaves_pending() {
        assert!(
            Transition::Claim {
                owner: ConsumerId::new("w1").unwrap(),
                expires_at: t(1)
            }
            .is_allowed_from(CommandState::Pending)
        );
        assert!(!Transition::Complete.is_allowed_from(CommandState::Pending));
        assert!(!Transition::Release.is_allowed_from(CommandState::Pending));
        assert!(!Transition::Expire.is_allowed_from(CommandState::Pending));
    }

    #[test]
    fn view_exposes_lease_fields_only_when_claimed() {
        let mut r = record();
        let pending = CommandView::from(&r);
        assert!(pending.lease_owner.is_none() && pending.lease_expires_at.is_none());

        r.apply(
            Transition::Claim {
                owner: ConsumerId::new("w2").unwrap(),
                expires_at: t(5),
            },
            t(0),
        );
        let claimed = CommandView::from(&r);
        assert_eq!(claimed.lease_owner, Some(ConsumerId::new("w2").unwrap()));
        assert_eq!(claimed.lease_expires_at, Some(t(5)));
        assert!(ClaimedCommand::from_record(&r).is_some());

        r.apply(Transition::Complete, t(1));
        assert!(ClaimedCommand::from_record(&r).is_none());
        assert_eq!(CommandView::from(&r).state, CommandState::Completed);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn transition_strategy() -> impl Strategy<Value = Transition> {
            prop_oneof![
                (0u8..3, 0i64..100).prop_map(|(w, secs)| Transition::Claim {
                    owner: ConsumerId::new(format!("w{w}")).unwrap(),
                    expires_at: t(secs),
                }),
                (0i64..100).prop_map(|secs| Transition::Renew { expires_at: t(secs) }),
                Just(Transition::Complete),
                Just(Transition::Fail),
                Just(Transition::Release),
                Just(Transition::Expire),
            ]
        }

        proptest! {
            /// Property: applying only legal transitions keeps the lease/state
            /// invariant, never lowers `attempt`, and bumps it by exactly one
            /// per claim.
            #[test]
            fn legal_sequences_preserve_invariants(
                transitions in proptest::collection::vec(transition_strategy(), 0..40)
            ) {
                let mut r = record();
                for (i, tr) in transitions.into_iter().enumerate() {
                    if !tr.is_allowed_from(r.state()) {
                        continue;
                    }
                    let before = r.attempt;
                    let was_terminal = r.state().is_terminal();
                    let is_claim = matches!(tr, Transition::Claim { .. });
                    r.apply(tr, t(i as i64));

                    prop_assert!(!was_terminal);
                    prop_assert_eq!(r.attempt, if is_claim { before + 1 } else { before });
                    prop_assert_eq!(r.lease().is_some(), r.state() == CommandState::Claimed);
                }
            }
        }
    }
}
