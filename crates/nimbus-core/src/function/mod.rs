//! Remote-side function execution
//!
//! Functions and initializers are registered by name; payloads reference
//! them by name and carry JSON arguments.

mod error;
mod registry;

pub use error::{CallError, CallErrorKind};
pub use registry::{FunctionRef, FunctionRegistry, Globals, InitializerRef, RegistryError};

use crate::dispatch::CallPayload;
use crate::store::StoredOutcome;

/// Worker entrypoint: run one payload and produce the outcome to record
pub fn execute_payload(registry: &FunctionRegistry, payload: &CallPayload) -> StoredOutcome {
    registry.execute(payload).into()
}
