use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};

use cmdlease_core::{CommandId, CommandRecord, StateVersion, Transition};

use super::r#trait::{CommandFilter, CommandStore, CommandStoreError};

type Slot = Arc<Mutex<CommandRecord>>;

/// In-memory command store.
///
/// Each record sits behind its own mutex; the map lock is held for writing
/// only while inserting or removing. A transition takes the map read lock and
/// one record lock, so work on different ids proceeds in parallel.
///
/// Intended for tests/dev and single-process embedding. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryCommandStore {
    records: RwLock<HashMap<CommandId, Slot>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: CommandId) -> Result<Slot, CommandStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        records.get(&id).cloned().ok_or(CommandStoreError::NotFound(id))
    }
}

fn poisoned() -> CommandStoreError {
    CommandStoreError::Storage("lock poisoned".to_string())
}

fn lock(slot: &Slot) -> Result<MutexGuard<'_, CommandRecord>, CommandStoreError> {
    slot.lock().map_err(|_| poisoned())
}

impl CommandStore for InMemoryCommandStore {
    fn put(&self, record: CommandRecord) -> Result<(), CommandStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.contains_key(&record.id) {
            return Err(CommandStoreError::DuplicateId(record.id));
        }
        records.insert(record.id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    fn get(&self, id: CommandId) -> Result<CommandRecord, CommandStoreError> {
        let slot = self.slot(id)?;
        let record = lock(&slot)?;
        Ok(record.clone())
    }

    fn compare_and_transition(
        &self,
        id: CommandId,
        expected: StateVersion,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<CommandRecord, CommandStoreError> {
        // Cloning the Arc releases the map lock before we block on the record.
        let slot = self.slot(id)?;
        let mut record = lock(&slot)?;

        let actual = record.version();
        if actual != expected {
            return Err(CommandStoreError::ConflictingState {
                id,
                expected,
                actual,
            });
        }
        if !transition.is_allowed_from(actual.state) {
            return Err(CommandStoreError::IllegalTransition {
                id,
                from: actual,
                transition: transition.name(),
            });
        }

        record.apply(transition, at);
        Ok(record.clone())
    }

    fn scan(&self, filter: &CommandFilter) -> Result<Vec<CommandRecord>, CommandStoreError> {
        let slots: Vec<Slot> = {
            let records = self.records.read().map_err(|_| poisoned())?;
            records.values().cloned().collect()
        };

        let mut result = Vec::new();
        for slot in &slots {
            let record = lock(slot)?;
            if filter.matches(&record) {
                result.push(record.clone());
            }
        }

        result.sort_by_key(|r| (r.created_at, r.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn remove_terminal_before(&self, horizon: DateTime<Utc>) -> Result<usize, CommandStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let mut doomed = Vec::new();
        for (id, slot) in records.iter() {
            let record = lock(slot)?;
            if record.state().is_terminal() && record.updated_at < horizon {
                doomed.push(*id);
            }
        }
        for id in &doomed {
            records.remove(id);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdlease_core::{CommandState, ConsumerId};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn pending(at: i64) -> CommandRecord {
        CommandRecord::new(CommandId::new(), "echo", serde_json::json!("hi"), t(at))
    }

    fn claim(owner: &str, expires: i64) -> Transition {
        Transition::Claim {
            owner: ConsumerId::new(owner).unwrap(),
            expires_at: t(expires),
        }
    }

    #[test]
    fn put_and_get() {
        let store = InMemoryCommandStore::new();
        let record = pending(0);
        let id = record.id;
        store.put(record.clone()).unwrap();
        assert_eq!(store.get(id).unwrap(), record);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_rejects_duplicate_id() {
        let store = InMemoryCommandStore::new();
        let record = pending(0);
        store.put(record.clone()).unwrap();
        assert_eq!(
            store.put(record.clone()),
            Err(CommandStoreError::DuplicateId(record.id))
        );
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = InMemoryCommandStore::new();
        let id = CommandId::new();
        assert_eq!(store.get(id), Err(CommandStoreError::NotFound(id)));
    }

    #[test]
    fn cas_applies_on_match() {
        let store = InMemoryCommandStore::new();
        let record = pending(0);
        let id = record.id;
        store.put(record).unwrap();

        let updated = store
            .compare_and_transition(
                id,
                StateVersion::new(CommandState::Pending, 0),
                claim("w1", 10),
                t(1),
            )
            .unwrap();
        assert_eq!(updated.version(), StateVersion::new(CommandState::Claimed, 1));
        assert_eq!(store.get(id).unwrap(), updated);
    }

    #[test]
    fn cas_rejects_mismatch_without_change() {
        let store = InMemoryCommandStore::new();
        let record = pending(0);
        let id = record.id;
        store.put(record.clone()).unwrap();

        let err = store
            .compare_and_transition(
                id,
                StateVersion::new(CommandState::Claimed, 1),
                Transition::Complete,
                t(1),
            )
            .unwrap_err();
        assert_eq!(
            err,
            CommandStoreError::ConflictingState {
                id,
                expected: StateVersion::new(CommandState::Claimed, 1),
                actual: StateVersion::new(CommandState::Pending, 0),
            }
        );
        assert_eq!(store.get(id).unwrap(), record);
    }

    #[test]
    fn cas_rejects_illegal_edge() {
        let store = InMemoryCommandStore::new();
        let record = pending(0);
        let id = record.id;
        store.put(record).unwrap();

        let err = store
            .compare_and_transition(
                id,
                StateVersion::new(CommandState::Pending, 0),
                Transition::Complete,
                t(1),
            )
            .unwrap_err();
        assert!(matches!(err, CommandStoreError::IllegalTransition { .. }));
    }

    #[test]
    fn scan_orders_by_created_at_then_id() {
        let store = InMemoryCommandStore::new();
        let late = pending(5);
        let early = pending(1);
        let tied_a = pending(3);
        let tied_b = pending(3);
        for r in [&late, &early, &tied_a, &tied_b] {
            store.put(r.clone()).unwrap();
        }

        let ids: Vec<_> = store
            .scan(&CommandFilter::all())
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let (first_tied, second_tied) = if tied_a.id < tied_b.id {
            (tied_a.id, tied_b.id)
        } else {
            (tied_b.id, tied_a.id)
        };
        assert_eq!(ids, vec![early.id, first_tied, second_tied, late.id]);
    }

    #[test]
    fn scan_filters_by_state_type_and_limit() {
        let store = InMemoryCommandStore::new();
        let a = pending(0);
        let b = CommandRecord::new(CommandId::new(), "resize", serde_json::json!({"w": 1}), t(1));
        let c = pending(2);
        for r in [&a, &b, &c] {
            store.put(r.clone()).unwrap();
        }
        store
            .compare_and_transition(
                a.id,
                StateVersion::new(CommandState::Pending, 0),
                claim("w1", 10),
                t(1),
            )
            .unwrap();

        let pending_echo = store
            .scan(&CommandFilter::in_states([CommandState::Pending]).with_type("echo"))
            .unwrap();
        assert_eq!(pending_echo.len(), 1);
        assert_eq!(pending_echo[0].id, c.id);

        let limited = store.scan(&CommandFilter::all().with_limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn remove_terminal_before_spares_live_and_recent() {
        let store = InMemoryCommandStore::new();
        let old_done = pending(0);
        let new_done = pending(0);
        let live = pending(0);
        for r in [&old_done, &new_done, &live] {
            store.put(r.clone()).unwrap();
        }
        let claimed = StateVersion::new(CommandState::Claimed, 1);
        let fresh = StateVersion::new(CommandState::Pending, 0);

        store
            .compare_and_transition(old_done.id, fresh, claim("w", 100), t(1))
            .unwrap();
        store
            .compare_and_transition(old_done.id, claimed, Transition::Complete, t(2))
            .unwrap();
        store
            .compare_and_transition(new_done.id, fresh, claim("w", 100), t(1))
            .unwrap();
        store
            .compare_and_transition(new_done.id, claimed, Transition::Fail, t(50))
            .unwrap();

        assert_eq!(store.remove_terminal_before(t(10)).unwrap(), 1);
        assert!(store.get(old_done.id).is_err());
        assert!(store.get(new_done.id).is_ok());
        assert!(store.get(live.id).is_ok());
    }

    #[test]
    fn concurrent_cas_on_one_id_has_one_winner() {
        let store = Arc::new(InMemoryCommandStore::new());
        let record = pending(0);
        let id = record.id;
        store.put(record).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .compare_and_transition(
                            id,
                            StateVersion::new(CommandState::Pending, 0),
                            claim(&format!("w{i}"), 10),
                            t(1),
                        )
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get(id).unwrap().attempt, 1);
    }
}
