//! In-process backend
//!
//! Accepts invocations, runs them on the blocking pool through a
//! [`FunctionRegistry`] and records outcomes in a [`ResultStore`], so the
//! engine runs end to end without a cloud account.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{BackendClient, BackendError, InvocationId};
use crate::dispatch::CallPayload;
use crate::function::{execute_payload, CallError, CallErrorKind, FunctionRegistry};
use crate::store::{ResultStore, StoreError, StoredOutcome};

/// Localhost backend
pub struct LocalBackend {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn ResultStore>,
    max_inflight: Option<usize>,
    inflight: Arc<AtomicUsize>,
    rejections: AtomicUsize,
}

impl LocalBackend {
    pub fn new(registry: Arc<FunctionRegistry>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            registry,
            store,
            max_inflight: None,
            inflight: Arc::new(AtomicUsize::new(0)),
            rejections: AtomicUsize::new(0),
        }
    }

    /// Throttle invocations once this many are executing
    pub fn with_max_inflight(mut self, limit: usize) -> Self {
        self.max_inflight = Some(limit);
        self
    }

    /// Throttle the next `count` invocations regardless of load
    pub fn reject_next(&self, count: usize) {
        self.rejections.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of invocations currently executing
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    fn take_rejection(&self) -> bool {
        self.rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn try_reserve(&self) -> Option<InflightGuard> {
        let limit = self.max_inflight.unwrap_or(usize::MAX);
        self.inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| InflightGuard(self.inflight.clone()))
    }
}

struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
    fn name(&self) -> &'static str {
        "localhost"
    }

    async fn invoke(
        &self,
        _package: &str,
        action_name: &str,
        payload: &CallPayload,
    ) -> Result<Option<InvocationId>, BackendError> {
        if self.take_rejection() {
            debug!(call_id = %payload.call_id, "Rejecting invocation");
            return Ok(None);
        }

        let Some(guard) = self.try_reserve() else {
            debug!(
                call_id = %payload.call_id,
                inflight = self.inflight(),
                "Local backend at capacity"
            );
            return Ok(None);
        };

        let activation_id = InvocationId::new(Uuid::now_v7().simple().to_string());
        let registry = self.registry.clone();
        let store = self.store.clone();
        let payload = payload.clone();

        debug!(
            action = %action_name,
            call_id = %payload.call_id,
            activation_id = %activation_id,
            "Executing locally"
        );

        tokio::spawn(async move {
            let _guard = guard;
            let executor_id = payload.executor_id.clone();
            let call_id = payload.call_id;

            let outcome = match tokio::task::spawn_blocking(move || {
                execute_payload(&registry, &payload)
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => StoredOutcome::Error {
                    error: CallError::new(
                        CallErrorKind::Internal,
                        format!("worker task failed: {e}"),
                    ),
                },
            };

            match store.put(&executor_id, call_id, outcome).await {
                Ok(()) => {}
                Err(StoreError::AlreadyRecorded { .. }) => {
                    warn!(%executor_id, %call_id, "Outcome already recorded");
                }
                Err(e) => {
                    error!(%executor_id, %call_id, error = %e, "Failed to record outcome");
                }
            }
        });

        Ok(Some(activation_id))
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "backend": self.name(),
            "max_inflight": self.max_inflight,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::dispatch::{CallId, ExecutorId};
    use crate::function::Globals;
    use crate::store::InMemoryResultStore;

    fn payload(call: usize) -> CallPayload {
        CallPayload {
            executor_id: ExecutorId::new("local-M000"),
            call_id: CallId::new(call),
            function: "square".to_string(),
            args: json!(call),
            initializer: None,
            runtime_memory: 256,
        }
    }

    fn backend() -> (LocalBackend, Arc<InMemoryResultStore>) {
        let mut registry = FunctionRegistry::new();
        registry
            .register_function("square", |_: &Globals, n: u64| Ok::<_, CallError>(n * n))
            .unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        (LocalBackend::new(Arc::new(registry), store.clone()), store)
    }

    async fn wait_for(store: &InMemoryResultStore, call: usize) -> StoredOutcome {
        let executor_id = ExecutorId::new("local-M000");
        loop {
            if let Some(outcome) = store.get(&executor_id, CallId::new(call)).await.unwrap() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_invoke_records_outcome() {
        let (backend, store) = backend();

        let id = backend.invoke("pkg", "action", &payload(3)).await.unwrap();
        assert!(id.is_some());
        assert_eq!(
            wait_for(&store, 3).await,
            StoredOutcome::Success { value: json!(9) }
        );
    }

    #[tokio::test]
    async fn test_reject_next_throttles() {
        let (backend, _store) = backend();
        backend.reject_next(2);

        assert_eq!(backend.invoke("pkg", "action", &payload(0)).await.unwrap(), None);
        assert_eq!(backend.invoke("pkg", "action", &payload(0)).await.unwrap(), None);
        assert!(backend
            .invoke("pkg", "action", &payload(0))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_zero_inflight_limit_always_throttles() {
        let (backend, _store) = backend();
        let backend = backend.with_max_inflight(0);

        assert_eq!(backend.invoke("pkg", "action", &payload(0)).await.unwrap(), None);
        assert_eq!(backend.inflight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_function_is_recorded_as_error() {
        let (backend, store) = backend();
        let mut bad = payload(1);
        bad.function = "missing".to_string();

        backend.invoke("pkg", "action", &bad).await.unwrap();
        match wait_for(&store, 1).await {
            StoredOutcome::Error { error } => assert_eq!(error.kind, CallErrorKind::UnknownFunction),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
