//! In-memory implementation of ResultStore

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ResultStore, StoreError, StoredOutcome};
use crate::dispatch::{CallId, ExecutorId};

/// In-memory implementation of ResultStore
///
/// Backs the localhost backend and tests. Writes for distinct calls never
/// contend, so a sharded concurrent map is all the locking needed.
///
/// # Example
///
/// ```
/// use nimbus_core::InMemoryResultStore;
///
/// let store = InMemoryResultStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    outcomes: DashMap<(ExecutorId, CallId), StoredOutcome>,
}

impl InMemoryResultStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of recorded outcomes
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.outcomes.clear();
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(
        &self,
        executor_id: &ExecutorId,
        call_id: CallId,
        outcome: StoredOutcome,
    ) -> Result<(), StoreError> {
        match self.outcomes.entry((executor_id.clone(), call_id)) {
            Entry::Occupied(_) => Err(StoreError::AlreadyRecorded {
                executor_id: executor_id.clone(),
                call_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(outcome);
                Ok(())
            }
        }
    }

    async fn get(
        &self,
        executor_id: &ExecutorId,
        call_id: CallId,
    ) -> Result<Option<StoredOutcome>, StoreError> {
        Ok(self
            .outcomes
            .get(&(executor_id.clone(), call_id))
            .map(|entry| entry.value().clone()))
    }

    async fn clean(&self, executor_id: &ExecutorId) -> Result<usize, StoreError> {
        let before = self.outcomes.len();
        self.outcomes.retain(|(id, _), _| id != executor_id);
        Ok(before.saturating_sub(self.outcomes.len()))
    }
}
