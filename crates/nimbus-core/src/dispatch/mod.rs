//! Job dispatch
//!
//! Partitions a batch of calls into payloads, submits them concurrently and
//! aggregates exactly one result per call.

mod dispatcher;
mod payload;
mod result;

pub use dispatcher::{DispatchError, DispatcherConfig, JobDispatcher, JobHandle};
pub use payload::{CallId, CallPayload, CallSpec, ExecutorId, PoolWorkerContext};
pub use result::{CallResult, CallStatus, JobResults};
