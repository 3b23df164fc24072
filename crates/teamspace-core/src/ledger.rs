//! Issue-ordered table of client mutations.
//!
//! Owned by the projector so the overlay and the mutation status always change
//! together; only the coordinator writes to it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::constants::SETTLED_MUTATION_CAPACITY;
use crate::error::SyncError;
use crate::models::{ClientMutation, MutationKind, MutationStatus};

#[derive(Debug, Default)]
pub struct MutationLedger {
    next_seq: u64,
    entries: BTreeMap<u64, ClientMutation>,
    by_id: HashMap<String, u64>,
    /// Settled entries, oldest first, evicted past the capacity
    settled: VecDeque<u64>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new pending mutation at the end of the issue order
    pub fn record(&mut self, mutation: ClientMutation) -> Result<(), SyncError> {
        if mutation.kind == MutationKind::Create && self.has_pending_create(&mutation.entity_id) {
            return Err(SyncError::DuplicateCreate {
                entity_id: mutation.entity_id,
            });
        }

        if let Some(&seq) = self.by_id.get(&mutation.mutation_id) {
            match self.entries.get(&seq).map(|existing| existing.status) {
                Some(MutationStatus::Pending) => {
                    return Err(SyncError::invalid(format!(
                        "mutation {} is already pending",
                        mutation.mutation_id
                    )));
                }
                Some(MutationStatus::Confirmed) => {
                    return Err(SyncError::invalid(format!(
                        "mutation {} is already confirmed",
                        mutation.mutation_id
                    )));
                }
                // Only a failed mutation may be resubmitted under its id
                Some(MutationStatus::Failed) | None => {
                    self.entries.remove(&seq);
                    self.settled.retain(|s| *s != seq);
                }
            }
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_id.insert(mutation.mutation_id.clone(), seq);
        self.entries.insert(seq, mutation);
        Ok(())
    }

    pub fn get(&self, mutation_id: &str) -> Option<&ClientMutation> {
        self.by_id
            .get(mutation_id)
            .and_then(|seq| self.entries.get(seq))
    }

    pub fn status(&self, mutation_id: &str) -> Option<MutationStatus> {
        self.get(mutation_id).map(|m| m.status)
    }

    /// `pending -> confirmed`. Returns false if the mutation was not pending.
    pub fn mark_confirmed(&mut self, mutation_id: &str) -> bool {
        self.settle(mutation_id, MutationStatus::Confirmed)
    }

    /// `pending -> failed`. A confirmed mutation never goes back.
    pub fn mark_failed(&mut self, mutation_id: &str) -> bool {
        self.settle(mutation_id, MutationStatus::Failed)
    }

    fn settle(&mut self, mutation_id: &str, status: MutationStatus) -> bool {
        let Some(&seq) = self.by_id.get(mutation_id) else {
            return false;
        };
        let Some(mutation) = self.entries.get_mut(&seq) else {
            return false;
        };
        if !mutation.is_pending() {
            return false;
        }
        mutation.status = status;

        self.settled.push_back(seq);
        while self.settled.len() > SETTLED_MUTATION_CAPACITY {
            if let Some(evicted) = self.settled.pop_front() {
                if let Some(old) = self.entries.remove(&evicted) {
                    self.by_id.remove(&old.mutation_id);
                }
            }
        }
        true
    }

    /// Pending mutations in issue order
    pub fn pending(&self) -> impl Iterator<Item = &ClientMutation> {
        self.entries.values().filter(|m| m.is_pending())
    }

    pub fn pending_for_entity<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a ClientMutation> + 'a {
        self.pending().filter(move |m| m.entity_id == entity_id)
    }

    pub fn has_pending_create(&self, entity_id: &str) -> bool {
        self.pending_for_entity(entity_id)
            .any(|m| m.kind == MutationKind::Create)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
