//! Per-call and per-job results

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CallId, ExecutorId};
use crate::backend::InvocationId;
use crate::function::{CallError, CallErrorKind};
use crate::store::StoredOutcome;

/// Terminal status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Function ran and produced a value
    Success,
    /// Function, initializer or backend reported an error
    Failed,
    /// Backend kept throttling until the attempt budget ran out
    ExhaustedRetries,
    /// Result did not materialize within the collection budget
    TimedOut,
    /// Stopped waiting after an abort, whether or not the backend had
    /// accepted the invocation
    Cancelled,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::ExhaustedRetries => write!(f, "exhausted_retries"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub call_id: CallId,
    pub status: CallStatus,

    /// Value on success, error otherwise
    pub outcome: Result<Value, CallError>,

    /// Backend invocation id, if the backend ever accepted the call
    pub invocation_id: Option<InvocationId>,
}

impl CallResult {
    /// Successful call
    pub fn success(call_id: CallId, value: Value, invocation_id: InvocationId) -> Self {
        Self {
            call_id,
            status: CallStatus::Success,
            outcome: Ok(value),
            invocation_id: Some(invocation_id),
        }
    }

    /// Failed call; the status is derived from the error kind
    pub fn failure(call_id: CallId, error: CallError, invocation_id: Option<InvocationId>) -> Self {
        let status = match error.kind {
            CallErrorKind::ExhaustedRetries => CallStatus::ExhaustedRetries,
            CallErrorKind::CollectionTimeout => CallStatus::TimedOut,
            CallErrorKind::Cancelled => CallStatus::Cancelled,
            _ => CallStatus::Failed,
        };

        Self {
            call_id,
            status,
            outcome: Err(error),
            invocation_id,
        }
    }

    /// Result built from a stored remote outcome
    pub fn from_stored(call_id: CallId, outcome: StoredOutcome, invocation_id: InvocationId) -> Self {
        match outcome {
            StoredOutcome::Success { value } => Self::success(call_id, value, invocation_id),
            StoredOutcome::Error { error } => Self::failure(call_id, error, Some(invocation_id)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }

    /// Consume into the value or error
    pub fn into_outcome(self) -> Result<Value, CallError> {
        self.outcome
    }
}

/// Results of one job, keyed by call id
#[derive(Debug, Clone, PartialEq)]
pub struct JobResults {
    pub executor_id: ExecutorId,
    results: BTreeMap<CallId, CallResult>,
}

impl JobResults {
    pub(crate) fn new(executor_id: ExecutorId, results: BTreeMap<CallId, CallResult>) -> Self {
        Self {
            executor_id,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, call_id: &CallId) -> Option<&CallResult> {
        self.results.get(call_id)
    }

    /// Iterate in call id order
    pub fn iter(&self) -> impl Iterator<Item = (&CallId, &CallResult)> {
        self.results.iter()
    }

    /// Number of calls with the given status
    pub fn count(&self, status: CallStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }

    /// Results in input order
    pub fn into_ordered(self) -> Vec<CallResult> {
        self.results.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_failure_status_follows_error_kind() {
        let exhausted = CallResult::failure(
            CallId::new(0),
            CallError::new(CallErrorKind::ExhaustedRetries, "5 attempts"),
            None,
        );
        assert_eq!(exhausted.status, CallStatus::ExhaustedRetries);

        let failed = CallResult::failure(CallId::new(1), CallError::function("boom"), None);
        assert_eq!(failed.status, CallStatus::Failed);
    }

    #[test]
    fn test_into_ordered_uses_position() {
        let mut results = BTreeMap::new();
        for index in [100_000, 2, 99_999] {
            let id = CallId::new(index);
            results.insert(
                id,
                CallResult::success(id, json!(index), InvocationId::new(format!("act-{index}"))),
            );
        }

        let ordered = JobResults::new(ExecutorId::new("x-M000"), results).into_ordered();
        let indices: Vec<usize> = ordered.iter().map(|r| r.call_id.index()).collect();
        assert_eq!(indices, vec![2, 99_999, 100_000]);
    }
}
