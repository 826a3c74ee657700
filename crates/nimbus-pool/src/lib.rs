//! # Nimbus pool
//!
//! A process-pool style interface over the nimbus invocation engine.
//!
//! ```text
//! Pool::map ──▶ JobDispatcher ──▶ Invoker ──▶ BackendClient
//!     ▲                                            │
//!     └──────── ordered results ◀── ResultStore ◀──┘
//! ```
//!
//! ## Semantics
//!
//! - One invocation per element, results in input order
//! - Failed elements are returned in place by default, or fail the whole map
//!   in [`FailureMode::Strict`]
//! - The initializer is re-run in front of every invocation; there is no
//!   worker process whose globals outlive a call
//! - `close` waits for in-flight maps, dropping the pool stops their retries

mod pool;

pub use pool::{FailureMode, Pool, PoolBuilder, PoolError, PoolOptions, PoolStatus};

pub use nimbus_core::{
    CallError, CallErrorKind, Config, FunctionRef, FunctionRegistry, Globals, InitializerRef,
    PoolWorkerContext,
};
