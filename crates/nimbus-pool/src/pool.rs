//! Worker pool front end

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::backend::{self, BackendClient};
use nimbus_core::{
    CallError, CallSpec, Config, ConfigError, DispatchError, DispatcherConfig, ExecutorId,
    FunctionRef, FunctionRegistry, InMemoryResultStore, InitializerRef, Invoker, JobDispatcher,
    PoolWorkerContext, ResultStore, RuntimeDescriptor, RuntimeResolver,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How `map` reports failed elements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Return every element, failed ones as `Err` in their position
    #[default]
    Collect,
    /// Fail the whole map on the first failed element in input order
    Strict,
}

/// Pool options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolOptions {
    pub failure_mode: FailureMode,

    /// Per-map collection budget; derived from the runtime timeout when unset
    pub collect_timeout: Option<Duration>,

    /// How long `close` waits for in-flight maps
    pub shutdown_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Collect,
            collect_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting maps
    Open,
    /// Waiting for in-flight maps, rejecting new ones
    Closing,
    /// Closed for good
    Closed,
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The batch was rejected before submission
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Arguments or initializer arguments could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An element failed in strict mode
    #[error("call {index} failed: {error}")]
    CallFailed {
        index: usize,
        #[source]
        error: CallError,
    },

    /// The pool no longer accepts work
    #[error("pool is closed")]
    Closed,

    /// In-flight maps did not finish in time
    #[error("pool shutdown timed out with {active} maps in flight")]
    ShutdownTimeout { active: usize },
}

/// Resolved runtime plus the dispatcher bound to it
struct Engine {
    descriptor: Arc<RuntimeDescriptor>,
    dispatcher: JobDispatcher,
}

/// Counts a map as in flight until dropped
struct ActiveMap(Arc<AtomicUsize>);

impl Drop for ActiveMap {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serverless worker pool
///
/// Each element passed to [`Pool::map`] becomes one remote invocation and
/// the results come back in input order.
///
/// Unlike a local process pool there are no long-lived workers: the
/// initializer runs in front of every single invocation, against state that
/// only that invocation sees. Anything it sets up is rebuilt per call and
/// never shared between calls.
///
/// # Example
///
/// ```ignore
/// let pool = Pool::builder(Config::localhost())
///     .registry(registry)
///     .initializer(&init, ("important global arg".to_string(), 123456))
///     .build()?;
///
/// let results = pool.map(&work, vec![0, 0, 0]).await?;
/// pool.close().await?;
/// ```
pub struct Pool {
    config: Config,
    context: Option<PoolWorkerContext>,
    options: PoolOptions,
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn ResultStore>,
    backend: Option<Arc<dyn BackendClient>>,
    resolver: RuntimeResolver,
    engine: OnceCell<Engine>,
    session: String,
    jobs: AtomicU32,
    active: Arc<AtomicUsize>,
    status: RwLock<PoolStatus>,
    cancel: CancellationToken,
}

impl Pool {
    /// Create a pool with default options
    ///
    /// Only validates `config`; the runtime is resolved on the first `map`.
    pub fn create(
        initializer: Option<PoolWorkerContext>,
        config: Config,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self, PoolError> {
        let mut builder = Self::builder(config).registry(registry);
        if let Some(context) = initializer {
            builder = builder.worker_context(context);
        }
        builder.build()
    }

    pub fn builder(config: Config) -> PoolBuilder {
        PoolBuilder::new(config)
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    /// Session prefix of every executor id this pool mints
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Initializer replicated into every payload
    pub fn worker_context(&self) -> Option<&PoolWorkerContext> {
        self.context.as_ref()
    }

    /// Resolved runtime, once the first map has run
    pub fn runtime(&self) -> Option<&RuntimeDescriptor> {
        self.engine.get().map(|engine| engine.descriptor.as_ref())
    }

    /// Number of maps currently in flight
    pub fn active_maps(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Apply `function` to every item
    ///
    /// Output position `i` holds the result for input position `i`. In
    /// [`FailureMode::Collect`] failures are returned in place; in
    /// [`FailureMode::Strict`] the first failure in input order is
    /// returned as [`PoolError::CallFailed`].
    #[instrument(skip(self, function, items), fields(session = %self.session, function = %function.name()))]
    pub async fn map<A, R, I>(
        &self,
        function: &FunctionRef<A, R>,
        items: I,
    ) -> Result<Vec<Result<R, CallError>>, PoolError>
    where
        A: Serialize,
        R: DeserializeOwned,
        I: IntoIterator<Item = A>,
    {
        let _active = self.enter()?;

        let calls = items
            .into_iter()
            .map(|item| CallSpec::typed(function, &item))
            .collect::<Result<Vec<_>, _>>()?;

        let engine = self.engine().await?;
        let executor_id = ExecutorId::for_job(&self.session, self.jobs.fetch_add(1, Ordering::SeqCst));

        debug!(%executor_id, calls = calls.len(), "Mapping");
        // Dropping or force-closing the pool stops this job's retries.
        let job = engine.dispatcher.submit_linked(
            &self.cancel,
            executor_id.clone(),
            engine.descriptor.clone(),
            calls,
            self.context.as_ref(),
        )?;

        let results = engine
            .dispatcher
            .collect(job, self.options.collect_timeout)
            .await;
        engine.dispatcher.clean(&executor_id).await;

        let mut output = Vec::with_capacity(results.len());
        for (index, result) in results.into_ordered().into_iter().enumerate() {
            let typed = result
                .into_outcome()
                .and_then(|value| serde_json::from_value::<R>(value).map_err(CallError::from));

            if let (FailureMode::Strict, Err(error)) = (self.options.failure_mode, &typed) {
                warn!(%executor_id, index, error = %error, "Call failed in strict mode");
                return Err(PoolError::CallFailed {
                    index,
                    error: error.clone(),
                });
            }
            output.push(typed);
        }

        Ok(output)
    }

    /// Stop accepting maps and wait for in-flight ones
    ///
    /// If they do not finish within the shutdown timeout their retries are
    /// cancelled and [`PoolError::ShutdownTimeout`] is returned; the pool
    /// is closed either way.
    pub async fn close(&self) -> Result<(), PoolError> {
        {
            let mut status = self.status.write();
            if *status == PoolStatus::Closed {
                return Ok(());
            }
            *status = PoolStatus::Closing;
        }

        info!(session = %self.session, "Closing pool");

        let deadline = tokio::time::Instant::now().checked_add(self.options.shutdown_timeout);
        loop {
            let active = self.active_maps();
            if active == 0 {
                debug!("All maps completed");
                break;
            }

            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                warn!(active_maps = active, "Shutdown timeout reached");
                self.cancel.cancel();
                *self.status.write() = PoolStatus::Closed;
                return Err(PoolError::ShutdownTimeout { active });
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = PoolStatus::Closed;
        info!(session = %self.session, "Pool closed");
        Ok(())
    }

    /// Run `f` with the pool and close it afterwards
    pub async fn scope<F, Fut, T>(self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<Pool>) -> Fut,
        Fut: Future<Output = T>,
    {
        let pool = Arc::new(self);
        let output = f(pool.clone()).await;
        pool.close().await?;
        Ok(output)
    }

    fn enter(&self) -> Result<ActiveMap, PoolError> {
        let status = self.status.read();
        if *status != PoolStatus::Open {
            return Err(PoolError::Closed);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ActiveMap(self.active.clone()))
    }

    async fn engine(&self) -> Result<&Engine, PoolError> {
        self.engine
            .get_or_try_init(|| async {
                let descriptor = Arc::new(self.resolver.resolve(&self.config)?);
                let backend = match &self.backend {
                    Some(backend) => backend.clone(),
                    None => backend::connect(&self.config, self.store.clone(), self.registry.clone())?,
                };

                let invoker = Arc::new(Invoker::from_config(backend, &self.config.nimbus));
                let dispatcher = JobDispatcher::new(
                    invoker,
                    self.store.clone(),
                    DispatcherConfig::from_config(&self.config, &descriptor),
                );

                info!(
                    session = %self.session,
                    runtime = %descriptor.runtime,
                    memory_mb = descriptor.memory_mb,
                    backend = dispatcher.invoker().backend().name(),
                    "Pool runtime resolved"
                );

                Ok::<_, PoolError>(Engine {
                    descriptor,
                    dispatcher,
                })
            })
            .await
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("session", &self.session)
            .field("backend", &self.config.nimbus.backend)
            .field("status", &self.status())
            .field("active_maps", &self.active_maps())
            .finish()
    }
}

/// Builder for [`Pool`]
pub struct PoolBuilder {
    config: Config,
    registry: Option<Arc<FunctionRegistry>>,
    store: Option<Arc<dyn ResultStore>>,
    backend: Option<Arc<dyn BackendClient>>,
    context: Option<Result<PoolWorkerContext, serde_json::Error>>,
    options: PoolOptions,
    runtime_version: Option<String>,
}

impl PoolBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            backend: None,
            context: None,
            options: PoolOptions::default(),
            runtime_version: None,
        }
    }

    /// Functions the localhost backend can execute
    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Result store shared with the workers (default: in-memory)
    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this backend instead of the one `nimbus.backend` selects
    pub fn backend(mut self, backend: Arc<dyn BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Run `initializer(initargs)` in front of every invocation
    pub fn initializer<A: Serialize>(mut self, initializer: &InitializerRef<A>, initargs: A) -> Self {
        self.context = Some(PoolWorkerContext::new(initializer, initargs));
        self
    }

    /// Replicate an already built worker context
    pub fn worker_context(mut self, context: PoolWorkerContext) -> Self {
        self.context = Some(Ok(context));
        self
    }

    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.options.failure_mode = mode;
        self
    }

    pub fn collect_timeout(mut self, timeout: Duration) -> Self {
        self.options.collect_timeout = Some(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    /// Resolve default runtime images for this version instead of the host's
    pub fn runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    pub fn build(self) -> Result<Pool, PoolError> {
        self.config.validate()?;
        let context = self.context.transpose()?;

        let resolver = match self.runtime_version {
            Some(version) => RuntimeResolver::new(version),
            None => RuntimeResolver::for_host(),
        };
        let session = ExecutorId::new_session();

        debug!(
            %session,
            backend = %self.config.nimbus.backend,
            initializer = context.as_ref().map(|c| c.initializer.as_str()),
            "Pool created"
        );

        Ok(Pool {
            config: self.config,
            context,
            options: self.options,
            registry: self.registry.unwrap_or_default(),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryResultStore::new())),
            backend: self.backend,
            resolver,
            engine: OnceCell::new(),
            session,
            jobs: AtomicU32::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            status: RwLock::new(PoolStatus::Open),
            cancel: CancellationToken::new(),
        })
    }
}
