//! # Nimbus invocation engine
//!
//! Turns batches of ordinary function calls into invocations on a serverless
//! compute backend and tracks every call until it yields exactly one result.
//!
//! ## Features
//!
//! - **Runtime resolution**: image, memory and timeout from configuration, with
//!   version-keyed default images that fail closed on unknown versions
//! - **Bounded retry**: throttled invocations are retried after a sleep picked
//!   at random from a discrete set, fatal backend errors are never retried
//! - **Concurrent dispatch**: one task per call under a concurrency ceiling,
//!   partial failures never abort sibling calls
//! - **Result collection**: keyed polling of a result store with a deadline
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      JobDispatcher                           │
//! │  (call ids, payload replication, semaphore-limited tasks)   │
//! └─────────────────────────────────────────────────────────────┘
//!            │ submit                          ▲ collect
//!            ▼                                 │
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │         Invoker          │   │         ResultStore          │
//! │  (retry / backoff loop)  │   │  (executor_id, call_id) → ⋯  │
//! └──────────────────────────┘   └──────────────────────────────┘
//!            │                                 ▲
//!            ▼                                 │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BackendClient                           │
//! │  (IBM Cloud Functions, in-process localhost, ...)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use nimbus_core::prelude::*;
//!
//! let config = Config::from_file("nimbus.json")?;
//! let descriptor = Arc::new(RuntimeResolver::for_host().resolve(&config)?);
//! let backend = backend::connect(&config, store.clone(), registry)?;
//! let invoker = Arc::new(Invoker::new(backend, RetryPolicy::from_config(&config.nimbus)));
//! let dispatcher = JobDispatcher::new(invoker, store, DispatcherConfig::from_config(&config, &descriptor));
//!
//! let job = dispatcher.submit(ExecutorId::new("session-M000"), descriptor, calls, None)?;
//! let results = dispatcher.collect(job, None).await;
//! ```

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod function;
pub mod invoker;
pub mod runtime;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{self, BackendClient, BackendError, InvocationId};
    pub use crate::config::{BackendKind, Config, ConfigError, ExecutionConfig};
    pub use crate::dispatch::{
        CallId, CallPayload, CallResult, CallSpec, CallStatus, DispatchError, DispatcherConfig,
        ExecutorId, JobDispatcher, JobHandle, JobResults, PoolWorkerContext,
    };
    pub use crate::function::{
        CallError, CallErrorKind, FunctionRef, FunctionRegistry, Globals, InitializerRef,
    };
    pub use crate::invoker::{Invocation, InvokeError, Invoker, RetryPolicy};
    pub use crate::runtime::{RuntimeDescriptor, RuntimeResolver};
    pub use crate::store::{InMemoryResultStore, ResultStore, StoreError, StoredOutcome};
}

// Re-export key types at crate root
pub use backend::{BackendClient, BackendError, InvocationId};
pub use config::{Config, ConfigError};
pub use dispatch::{
    CallId, CallPayload, CallResult, CallSpec, CallStatus, DispatchError, DispatcherConfig,
    ExecutorId, JobDispatcher, JobHandle, JobResults, PoolWorkerContext,
};
pub use function::{CallError, CallErrorKind, FunctionRef, FunctionRegistry, Globals, InitializerRef};
pub use invoker::{Invocation, InvokeError, Invoker, RetryPolicy};
pub use runtime::{RuntimeDescriptor, RuntimeResolver};
pub use store::{InMemoryResultStore, ResultStore, StoreError, StoredOutcome};
