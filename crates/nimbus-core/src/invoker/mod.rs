//! Invocation with bounded retry
//!
//! The invoker turns one payload into one accepted backend invocation. A
//! throttled attempt (no invocation id) is retried after a randomized
//! sleep until the attempt budget runs out; fatal backend errors end the
//! call immediately.

mod retry;

pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendClient, BackendError, InvocationId};
use crate::config::ExecutionConfig;
use crate::dispatch::CallPayload;
use crate::function::{CallError, CallErrorKind};
use crate::runtime::RuntimeDescriptor;

/// Package the remote actions are deployed under
pub fn package_name() -> String {
    format!("nimbus_v{}", env!("CARGO_PKG_VERSION"))
}

/// Terminal invoker failures
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The backend kept throttling until the budget ran out
    #[error("invocation still throttled after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The backend refused the invocation; never retried
    #[error("invocation failed on attempt {attempt}: {source}")]
    Fatal {
        attempt: u32,
        #[source]
        source: BackendError,
    },

    /// The caller stopped waiting before the backend accepted the call
    #[error("invocation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl InvokeError {
    /// Attempts made before the failure
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ExhaustedRetries { attempts } | Self::Cancelled { attempts } => *attempts,
            Self::Fatal { attempt, .. } => *attempt,
        }
    }
}

impl From<InvokeError> for CallError {
    fn from(err: InvokeError) -> Self {
        let kind = match &err {
            InvokeError::ExhaustedRetries { .. } => CallErrorKind::ExhaustedRetries,
            InvokeError::Fatal { .. } => CallErrorKind::FatalInvocation,
            InvokeError::Cancelled { .. } => CallErrorKind::Cancelled,
        };
        CallError::new(kind, err.to_string()).with_details(json!({ "attempts": err.attempts() }))
    }
}

/// Accepted invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub id: InvocationId,

    /// Attempts it took, including the accepted one
    pub attempts: u32,
}

/// One iteration of the retry loop; logged and dropped
#[derive(Debug)]
struct InvocationAttempt {
    attempt_number: u32,
    invocation_id: Option<InvocationId>,
    timestamp: DateTime<Utc>,
    outcome: &'static str,
    error: Option<String>,
}

impl InvocationAttempt {
    fn record(attempt_number: u32, result: &Result<Option<InvocationId>, BackendError>) -> Self {
        let (invocation_id, outcome, error) = match result {
            Ok(Some(id)) => (Some(id.clone()), "accepted", None),
            Ok(None) => (None, "throttled", None),
            Err(e) => (None, "fatal", Some(e.to_string())),
        };

        Self {
            attempt_number,
            invocation_id,
            timestamp: Utc::now(),
            outcome,
            error,
        }
    }

    fn log(&self, payload: &CallPayload) {
        debug!(
            executor_id = %payload.executor_id,
            call_id = %payload.call_id,
            attempt = self.attempt_number,
            invocation_id = ?self.invocation_id,
            outcome = self.outcome,
            error = ?self.error,
            at = %self.timestamp,
            "Invocation attempt"
        );
    }
}

/// Submits payloads to a backend with bounded retry
///
/// Holds no per-call state, so one invoker serves every concurrent call
/// of a job.
pub struct Invoker {
    backend: Arc<dyn BackendClient>,
    policy: RetryPolicy,
    package: String,
    invoke_timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(backend: Arc<dyn BackendClient>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            package: package_name(),
            invoke_timeout: None,
        }
    }

    /// Invoker for the execution group's retry settings and time budget
    pub fn from_config(backend: Arc<dyn BackendClient>, config: &ExecutionConfig) -> Self {
        Self::new(backend, RetryPolicy::from_config(config))
            .with_invoke_timeout(config.invoke_timeout())
    }

    /// Stop retrying once this much time has passed for a call
    pub fn with_invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    /// Invoke one payload
    ///
    /// Resubmits the identical payload on every attempt. Cancellation
    /// interrupts backoff sleeps; an in-flight request is always allowed
    /// to return so an accepted invocation is never lost.
    #[instrument(
        skip(self, payload, descriptor, cancel),
        fields(executor_id = %payload.executor_id, call_id = %payload.call_id)
    )]
    pub async fn invoke(
        &self,
        payload: &CallPayload,
        descriptor: &RuntimeDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let action_name = descriptor.action_name_for(payload.runtime_memory);
        // A budget past the clock's range is no budget at all.
        let deadline = self
            .invoke_timeout
            .and_then(|budget| Instant::now().checked_add(budget));
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled { attempts: attempt });
            }

            attempt += 1;
            let result = self
                .backend
                .invoke(&self.package, &action_name, payload)
                .await;
            InvocationAttempt::record(attempt, &result).log(payload);

            match result {
                Ok(Some(id)) => {
                    return Ok(Invocation {
                        id,
                        attempts: attempt,
                    })
                }
                Ok(None) => {}
                Err(source) => {
                    warn!(
                        executor_id = %payload.executor_id,
                        call_id = %payload.call_id,
                        attempt,
                        error = %source,
                        "Invocation failed"
                    );
                    return Err(InvokeError::Fatal { attempt, source });
                }
            }

            if !self.policy.has_attempts_remaining(attempt) {
                warn!(
                    executor_id = %payload.executor_id,
                    call_id = %payload.call_id,
                    attempts = attempt,
                    "Retries exhausted"
                );
                return Err(InvokeError::ExhaustedRetries { attempts: attempt });
            }

            let sleep = self.policy.next_sleep();
            if let Some(deadline) = deadline {
                let wakes_at = Instant::now().checked_add(sleep);
                if wakes_at.map_or(true, |at| at >= deadline) {
                    warn!(
                        executor_id = %payload.executor_id,
                        call_id = %payload.call_id,
                        attempts = attempt,
                        "Invoke timeout reached"
                    );
                    return Err(InvokeError::ExhaustedRetries { attempts: attempt });
                }
            }

            debug!(
                executor_id = %payload.executor_id,
                call_id = %payload.call_id,
                attempt = attempt + 1,
                sleep_secs = sleep.as_secs_f64(),
                "Invocation throttled, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(InvokeError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Effective runtime and backend settings
    pub fn config(&self, descriptor: &RuntimeDescriptor) -> serde_json::Value {
        json!({
            "package": self.package,
            "action_name": descriptor.action_name(),
            "runtime": descriptor,
            "retry": self.policy,
            "invoke_timeout_secs": self.invoke_timeout.map(|t| t.as_secs()),
            "backend": self.backend.config(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::dispatch::{CallId, ExecutorId};

    /// Backend that replays a scripted sequence of answers
    struct ScriptedBackend {
        answers: Mutex<VecDeque<Result<Option<InvocationId>, BackendError>>>,
        calls: Mutex<Vec<(String, String, CallPayload)>>,
    }

    impl ScriptedBackend {
        fn new(answers: Vec<Result<Option<InvocationId>, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn throttling() -> Arc<Self> {
            Self::new(Vec::new())
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn invoke(
            &self,
            package: &str,
            action_name: &str,
            payload: &CallPayload,
        ) -> Result<Option<InvocationId>, BackendError> {
            self.calls
                .lock()
                .push((package.to_string(), action_name.to_string(), payload.clone()));
            self.answers.lock().pop_front().unwrap_or(Ok(None))
        }

        fn config(&self) -> serde_json::Value {
            json!({ "backend": "scripted" })
        }
    }

    fn payload() -> CallPayload {
        CallPayload {
            executor_id: ExecutorId::new("abc-M000"),
            call_id: CallId::new(0),
            function: "work".to_string(),
            args: json!(0),
            initializer: None,
            runtime_memory: 512,
        }
    }

    fn descriptor() -> RuntimeDescriptor {
        RuntimeDescriptor {
            runtime: "alice/nimbus-kn-runtime-v02".to_string(),
            image_reference: "docker.io/alice/nimbus-kn-runtime-v02:latest".to_string(),
            memory_mb: 256,
            timeout_seconds: 600,
            docker_repo: "docker.io".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_accepted() {
        let backend = ScriptedBackend::new(vec![
            Ok(None),
            Ok(None),
            Ok(Some(InvocationId::new("id-42"))),
        ]);
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 3),
        );

        let started = Instant::now();
        let invocation = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(invocation.id, InvocationId::new("id-42"));
        assert_eq!(invocation.attempts, 3);
        assert_eq!(backend.call_count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_budget() {
        let backend = ScriptedBackend::throttling();
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 4),
        );

        let err = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::ExhaustedRetries { attempts: 4 }));
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Unauthorized(
            "bad key".to_string(),
        ))]);
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 5),
        );

        let err = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Fatal { attempt: 1, .. }));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(CallError::from(err).kind, CallErrorKind::FatalInvocation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_retry_gives_up_after_first_throttle() {
        let backend = ScriptedBackend::throttling();
        let invoker = Invoker::new(backend.clone(), RetryPolicy::no_retry());

        let err = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::ExhaustedRetries { attempts: 1 }));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_payload_and_action_on_every_attempt() {
        let backend = ScriptedBackend::throttling();
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 3),
        );

        let _ = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await;

        let calls = backend.calls.lock();
        assert_eq!(calls.len(), 3);
        for (package, action, sent) in calls.iter() {
            assert_eq!(package, &package_name());
            assert_eq!(action, "alice_nimbus-kn-runtime-v02_512MB");
            assert_eq!(sent, &payload());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_timeout_stops_retrying() {
        let backend = ScriptedBackend::throttling();
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(10), 100),
        )
        .with_invoke_timeout(Some(Duration::from_secs(25)));

        let err = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::ExhaustedRetries { attempts: 3 }));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_invoke_timeout_is_unbounded() {
        let backend = ScriptedBackend::new(vec![Ok(None), Ok(Some(InvocationId::new("id-7")))]);
        let invoker = Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 3),
        )
        .with_invoke_timeout(Some(Duration::from_secs(u64::MAX)));

        let invocation = invoker
            .invoke(&payload(), &descriptor(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(invocation.id, InvocationId::new("id-7"));
        assert_eq!(invocation.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let backend = ScriptedBackend::throttling();
        let invoker = Arc::new(Invoker::new(
            backend.clone(),
            RetryPolicy::fixed(Duration::from_secs(60), 5),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let invoker = invoker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { invoker.invoke(&payload(), &descriptor(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled { attempts: 1 }));
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn test_config_reports_runtime_and_backend() {
        let invoker = Invoker::new(ScriptedBackend::throttling(), RetryPolicy::no_retry());
        let config = invoker.config(&descriptor());

        assert_eq!(config["action_name"], json!("alice_nimbus-kn-runtime-v02_256MB"));
        assert_eq!(config["backend"]["backend"], json!("scripted"));
        assert_eq!(config["package"], json!(package_name()));
    }
}
