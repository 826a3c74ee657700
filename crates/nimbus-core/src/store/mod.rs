//! Result store abstraction
//!
//! Remote workers record each call's outcome under `(executor_id, call_id)`;
//! the dispatcher looks outcomes up with the same key.
//!
//! - [`ResultStore`] - Trait for result storage backends
//! - [`InMemoryResultStore`] - In-memory implementation (local backend, tests)

mod memory;

pub use memory::InMemoryResultStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::{CallId, ExecutorId};
use crate::function::CallError;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An outcome was already recorded for this call
    #[error("outcome already recorded for {executor_id}/{call_id}")]
    AlreadyRecorded {
        executor_id: ExecutorId,
        call_id: CallId,
    },

    /// Storage backend error
    #[error("storage error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Outcome recorded by a remote worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoredOutcome {
    /// The function returned a value
    Success { value: Value },

    /// The function or its initializer failed
    Error { error: CallError },
}

impl From<Result<Value, CallError>> for StoredOutcome {
    fn from(result: Result<Value, CallError>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(error) => Self::Error { error },
        }
    }
}

/// Keyed storage for call outcomes
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Record an outcome; the first write for a key wins
    async fn put(
        &self,
        executor_id: &ExecutorId,
        call_id: CallId,
        outcome: StoredOutcome,
    ) -> Result<(), StoreError>;

    /// Look an outcome up; `None` while the call has not finished
    async fn get(
        &self,
        executor_id: &ExecutorId,
        call_id: CallId,
    ) -> Result<Option<StoredOutcome>, StoreError>;

    /// Drop every outcome of a session, returning how many were removed
    async fn clean(&self, executor_id: &ExecutorId) -> Result<usize, StoreError>;
}
