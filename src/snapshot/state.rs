use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::common::{ServerId, SnapshotId};

use super::message::SnapshotMessage;

/// Everything recorded for one snapshot: token balances keyed by server id
/// and the token messages caught in flight on recording channels.
///
/// Each server's own record starts with a single balance entry (its own, at
/// the instant the snapshot started locally); the scheduler merges the
/// per-server records into the global cut once every server has completed.
/// A completed state is never mutated again and never deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotState {
    pub id: SnapshotId,
    pub tokens: BTreeMap<ServerId, u64>,
    pub messages: Vec<SnapshotMessage>,
}

impl SnapshotState {
    pub fn new(id: SnapshotId) -> Self {
        SnapshotState {
            id,
            tokens: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    /// Recorded balances plus recorded in-flight tokens. For a merged global
    /// snapshot this must equal the amount in the system at initiation.
    pub fn total_tokens(&self) -> u64 {
        let balances: u64 = self.tokens.values().sum();
        let in_flight: u64 = self
            .messages
            .iter()
            .map(|message| message.message.num_tokens)
            .sum();
        balances + in_flight
    }

    /// Fold another server's completed record for the same snapshot into
    /// this one.
    pub fn merge(&mut self, other: &SnapshotState) {
        for (server_id, tokens) in &other.tokens {
            self.tokens.insert(server_id.clone(), *tokens);
        }
        self.messages.extend(other.messages.iter().cloned());
    }
}

/// Concurrency-safe map of per-snapshot records, keyed by snapshot id.
///
/// The only shared mutable collection in the protocol core; servers may be
/// driven for several logically-concurrent snapshot ids at once, so access
/// synchronizes internally rather than leaning on the caller.
#[derive(Default)]
pub struct SnapshotStore {
    inner: Mutex<HashMap<SnapshotId, SnapshotState>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    pub fn insert(&self, id: SnapshotId, state: SnapshotState) {
        self.inner.lock().unwrap().insert(id, state);
    }

    /// First write wins: a record already present (e.g. stored by a racing
    /// inbound marker) is left untouched.
    pub fn insert_if_absent(&self, id: SnapshotId, state: SnapshotState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&id) {
            false
        } else {
            inner.insert(id, state);
            true
        }
    }

    pub fn get(&self, id: SnapshotId) -> Option<SnapshotState> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: SnapshotId) -> Option<SnapshotState> {
        self.inner.lock().unwrap().remove(&id)
    }

    /// Visit every stored record, in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(&mut SnapshotState)) {
        for state in self.inner.lock().unwrap().values_mut() {
            f(state);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
