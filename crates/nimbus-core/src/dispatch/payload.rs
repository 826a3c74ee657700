//! Call payloads and identifiers

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::function::{FunctionRef, InitializerRef};

/// Logical job session under which a batch of calls is submitted and collected
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for the `job`-th batch of a session (`{session}-M{job:03}`)
    pub fn for_job(session: &str, job: u32) -> Self {
        Self(format!("{session}-M{job:03}"))
    }

    /// Mint a new session prefix
    pub fn new_session() -> String {
        Uuid::now_v7().simple().to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call identifier, unique within its executor session
///
/// Derived from the zero-based input position and rendered zero-padded
/// (`00000`, `00001`, ...). Ordering follows the position, not the string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CallId(usize);

impl CallId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Zero-based position in the submitted batch
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl From<CallId> for String {
    fn from(id: CallId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CallId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(CallId)
    }
}

/// Initializer and arguments replicated into every payload of a pool
///
/// The remote model keeps no process between invocations, so this is
/// re-applied in front of every call rather than run once per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolWorkerContext {
    /// Registered initializer name
    pub initializer: String,

    /// Initializer arguments
    pub initargs: Value,
}

impl PoolWorkerContext {
    /// Build a context from a typed initializer handle
    pub fn new<A: Serialize>(
        initializer: &InitializerRef<A>,
        initargs: A,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            initializer: initializer.name().to_string(),
            initargs: serde_json::to_value(initargs)?,
        })
    }
}

/// One logical call before partitioning
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    /// Registered function name
    pub function: String,

    /// Function arguments
    pub args: Value,
}

impl CallSpec {
    pub fn new(function: impl Into<String>, args: Value) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Build a call from a typed function handle
    pub fn typed<A: Serialize, R>(
        function: &FunctionRef<A, R>,
        args: &A,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(function.name(), serde_json::to_value(args)?))
    }
}

/// Payload sent to the backend for one call
///
/// Immutable once built; retries resubmit the identical payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub executor_id: ExecutorId,
    pub call_id: CallId,

    /// Registered function name
    pub function: String,

    /// Function arguments
    pub args: Value,

    /// Worker initializer re-run before the function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<PoolWorkerContext>,

    /// Memory tier the call runs at (MB)
    pub runtime_memory: u32,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_call_id_format_and_order() {
        assert_eq!(CallId::new(7).to_string(), "00007");
        assert!(CallId::new(99_999) < CallId::new(100_000));
    }

    #[test]
    fn test_call_id_serializes_as_string() {
        let json = serde_json::to_value(CallId::new(3)).unwrap();
        assert_eq!(json, json!("00003"));
        let parsed: CallId = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.index(), 3);
    }

    #[test]
    fn test_executor_id_for_job() {
        assert_eq!(ExecutorId::for_job("abc", 2).as_str(), "abc-M002");
    }

    #[test]
    fn test_payload_omits_missing_initializer() {
        let payload = CallPayload {
            executor_id: ExecutorId::new("abc-M000"),
            call_id: CallId::new(0),
            function: "work".to_string(),
            args: json!(1),
            initializer: None,
            runtime_memory: 256,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["call_id"], json!("00000"));
        assert!(json.get("initializer").is_none());
    }
}
