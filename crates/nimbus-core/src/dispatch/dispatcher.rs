//! Concurrent submission and result collection

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{
    CallId, CallPayload, CallResult, CallSpec, CallStatus, ExecutorId, JobResults,
    PoolWorkerContext,
};
use crate::backend::InvocationId;
use crate::config::{
    Config, COLLECT_SLACK_SECS, MAX_CONCURRENCY_DEFAULT, POLL_INTERVAL_MS_DEFAULT,
    RUNTIME_TIMEOUT_DEFAULT,
};
use crate::function::{CallError, CallErrorKind};
use crate::invoker::Invoker;
use crate::runtime::RuntimeDescriptor;
use crate::store::ResultStore;

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Concurrent submissions against the backend
    pub max_concurrency: usize,

    /// Default wait budget for collection
    #[serde(with = "duration_millis")]
    pub collect_timeout: Duration,

    /// Result-store poll interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: MAX_CONCURRENCY_DEFAULT,
            collect_timeout: Duration::from_secs(RUNTIME_TIMEOUT_DEFAULT + COLLECT_SLACK_SECS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS_DEFAULT),
        }
    }
}

impl DispatcherConfig {
    /// Derive from the execution group
    ///
    /// Without an explicit `collect_timeout` a job waits for the runtime
    /// timeout plus a small slack.
    pub fn from_config(config: &Config, descriptor: &RuntimeDescriptor) -> Self {
        let collect_secs = config
            .nimbus
            .collect_timeout
            .unwrap_or(descriptor.timeout_seconds.saturating_add(COLLECT_SLACK_SECS));

        Self {
            max_concurrency: config.nimbus.max_concurrency.max(1),
            collect_timeout: Duration::from_secs(collect_secs),
            poll_interval: config.nimbus.poll_interval(),
        }
    }

    /// Set the concurrency ceiling
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the collection budget
    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = timeout;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Dispatch errors
///
/// Raised before any call is submitted; per-call failures are results.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A call in the batch cannot be turned into a payload
    #[error("call {index} is malformed: {reason}")]
    MalformedCall { index: usize, reason: String },
}

#[derive(Debug, Clone)]
enum CallState {
    /// The backend accepted the invocation; the outcome lands in the store
    Accepted(InvocationId),
    /// The call ended without reaching the store
    Finished(CallResult),
}

/// Handle to a submitted job
///
/// Dropping the handle without collecting leaves submission tasks running
/// until the job's cancellation token fires.
pub struct JobHandle {
    executor_id: ExecutorId,
    call_ids: Vec<CallId>,
    states: Arc<DashMap<CallId, CallState>>,
    tasks: JoinSet<()>,
    task_calls: HashMap<TaskId, CallId>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn len(&self) -> usize {
        self.call_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.call_ids.is_empty()
    }

    /// Token that stops retries and collection for this job
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop waiting for this job
    ///
    /// Calls in backoff stop retrying. Invocations the backend already
    /// accepted are not retracted.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Reap finished submission tasks; a panicked task becomes an internal
    /// failure for its call
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            match joined {
                Ok((id, ())) => {
                    self.task_calls.remove(&id);
                }
                Err(err) => {
                    let Some(call_id) = self.task_calls.remove(&err.id()) else {
                        continue;
                    };
                    if self.states.contains_key(&call_id) {
                        continue;
                    }
                    error!(
                        executor_id = %self.executor_id,
                        %call_id,
                        error = %err,
                        "Submission task failed"
                    );
                    let failure = CallError::new(
                        CallErrorKind::Internal,
                        format!("submission task failed: {err}"),
                    );
                    self.states.insert(
                        call_id,
                        CallState::Finished(CallResult::failure(call_id, failure, None)),
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("executor_id", &self.executor_id)
            .field("calls", &self.call_ids.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Partitions batches into payloads and tracks them to completion
pub struct JobDispatcher {
    invoker: Arc<Invoker>,
    store: Arc<dyn ResultStore>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl JobDispatcher {
    pub fn new(
        invoker: Arc<Invoker>,
        store: Arc<dyn ResultStore>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            invoker,
            store,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    /// Submit a batch
    ///
    /// Call ids follow input positions and `context` is copied unchanged
    /// into every payload. Spawns one task per call, so this must run
    /// inside a Tokio runtime. The whole batch is validated before any
    /// call is submitted.
    pub fn submit(
        &self,
        executor_id: ExecutorId,
        descriptor: Arc<RuntimeDescriptor>,
        calls: Vec<CallSpec>,
        context: Option<&PoolWorkerContext>,
    ) -> Result<JobHandle, DispatchError> {
        self.submit_with_token(executor_id, descriptor, calls, context, CancellationToken::new())
    }

    /// Submit a batch that is aborted whenever `parent` is cancelled
    ///
    /// Aborting the job itself leaves `parent` untouched.
    pub fn submit_linked(
        &self,
        parent: &CancellationToken,
        executor_id: ExecutorId,
        descriptor: Arc<RuntimeDescriptor>,
        calls: Vec<CallSpec>,
        context: Option<&PoolWorkerContext>,
    ) -> Result<JobHandle, DispatchError> {
        self.submit_with_token(executor_id, descriptor, calls, context, parent.child_token())
    }

    fn submit_with_token(
        &self,
        executor_id: ExecutorId,
        descriptor: Arc<RuntimeDescriptor>,
        calls: Vec<CallSpec>,
        context: Option<&PoolWorkerContext>,
        cancel: CancellationToken,
    ) -> Result<JobHandle, DispatchError> {
        if let Some(index) = calls.iter().position(|c| c.function.trim().is_empty()) {
            return Err(DispatchError::MalformedCall {
                index,
                reason: "function name is empty".to_string(),
            });
        }

        let payloads: Vec<CallPayload> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| CallPayload {
                executor_id: executor_id.clone(),
                call_id: CallId::new(index),
                function: call.function,
                args: call.args,
                initializer: context.cloned(),
                runtime_memory: descriptor.memory_mb,
            })
            .collect();

        let call_ids: Vec<CallId> = payloads.iter().map(|p| p.call_id).collect();
        let states = Arc::new(DashMap::with_capacity(payloads.len()));
        let mut tasks = JoinSet::new();
        let mut task_calls = HashMap::with_capacity(payloads.len());

        debug!(
            %executor_id,
            calls = payloads.len(),
            max_concurrency = self.config.max_concurrency,
            "Submitting job"
        );

        for payload in payloads {
            let call_id = payload.call_id;
            let invoker = self.invoker.clone();
            let permits = self.permits.clone();
            let descriptor = descriptor.clone();
            let states = states.clone();
            let cancel = cancel.clone();

            let handle = tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        let error = CallError::new(
                            CallErrorKind::Cancelled,
                            "job cancelled before submission",
                        );
                        let result = CallResult::failure(call_id, error, None);
                        states.insert(call_id, CallState::Finished(result));
                        return;
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            let error = CallError::new(
                                CallErrorKind::Internal,
                                "dispatcher semaphore closed",
                            );
                            let result = CallResult::failure(call_id, error, None);
                            states.insert(call_id, CallState::Finished(result));
                            return;
                        }
                    },
                };

                let state = match invoker.invoke(&payload, &descriptor, &cancel).await {
                    Ok(invocation) => CallState::Accepted(invocation.id),
                    Err(err) => CallState::Finished(CallResult::failure(call_id, err.into(), None)),
                };
                states.insert(call_id, state);
            });
            task_calls.insert(handle.id(), call_id);
        }

        Ok(JobHandle {
            executor_id,
            call_ids,
            states,
            tasks,
            task_calls,
            cancel,
        })
    }

    /// Collect one result per call
    ///
    /// Polls the result store until every call has an outcome, the deadline
    /// passes, or the job is aborted. Calls still pending at that point
    /// become `timed_out` (or `cancelled` after an abort); results already
    /// gathered are kept. Submission tasks still in backoff are stopped.
    /// A budget too large to represent as a deadline waits without limit.
    #[instrument(
        skip(self, job),
        fields(executor_id = %job.executor_id, calls = job.call_ids.len())
    )]
    pub async fn collect(&self, mut job: JobHandle, timeout: Option<Duration>) -> JobResults {
        let budget = timeout.unwrap_or(self.config.collect_timeout);
        let deadline = Instant::now().checked_add(budget);
        let mut results: BTreeMap<CallId, CallResult> = BTreeMap::new();

        loop {
            job.reap();
            self.gather(&job, &mut results).await;

            if results.len() == job.call_ids.len() || job.cancel.is_cancelled() {
                break;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };
            tokio::select! {
                _ = job.cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let aborted = job.cancel.is_cancelled() && results.len() < job.call_ids.len();
        job.cancel.cancel();

        for call_id in &job.call_ids {
            if results.contains_key(call_id) {
                continue;
            }

            let invocation_id = match job.states.get(call_id).map(|s| s.value().clone()) {
                Some(CallState::Finished(result)) => {
                    results.insert(*call_id, result);
                    continue;
                }
                Some(CallState::Accepted(id)) => Some(id),
                None => None,
            };

            let error = if aborted {
                CallError::new(CallErrorKind::Cancelled, "job aborted while waiting")
            } else {
                CallError::new(
                    CallErrorKind::CollectionTimeout,
                    format!("no result within {}s", budget.as_secs_f64()),
                )
            };
            results.insert(*call_id, CallResult::failure(*call_id, error, invocation_id));
        }

        // Requests still in flight are allowed to finish on their own.
        job.tasks.detach_all();

        let job_results = JobResults::new(job.executor_id.clone(), results);
        info!(
            executor_id = %job.executor_id,
            calls = job_results.len(),
            succeeded = job_results.count(CallStatus::Success),
            failed = job_results.count(CallStatus::Failed),
            exhausted = job_results.count(CallStatus::ExhaustedRetries),
            timed_out = job_results.count(CallStatus::TimedOut),
            cancelled = job_results.count(CallStatus::Cancelled),
            "Job collected"
        );

        job_results
    }

    /// Drop stored outcomes of a finished job
    pub async fn clean(&self, executor_id: &ExecutorId) {
        match self.store.clean(executor_id).await {
            Ok(removed) => debug!(%executor_id, removed, "Cleaned job results"),
            Err(e) => warn!(%executor_id, error = %e, "Failed to clean job results"),
        }
    }

    async fn gather(&self, job: &JobHandle, results: &mut BTreeMap<CallId, CallResult>) {
        for call_id in &job.call_ids {
            if results.contains_key(call_id) {
                continue;
            }

            let invocation_id = match job.states.get(call_id).map(|s| s.value().clone()) {
                Some(CallState::Finished(result)) => {
                    results.insert(*call_id, result);
                    continue;
                }
                Some(CallState::Accepted(id)) => id,
                None => continue,
            };

            match self.store.get(&job.executor_id, *call_id).await {
                Ok(Some(outcome)) => {
                    results.insert(
                        *call_id,
                        CallResult::from_stored(*call_id, outcome, invocation_id),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        executor_id = %job.executor_id,
                        %call_id,
                        error = %e,
                        "Result lookup failed, will retry"
                    );
                }
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
