//! Per-call error value

use serde::{Deserialize, Serialize};

/// Category of a per-call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// The target function returned an error
    Function,
    /// The initializer returned an error
    Initializer,
    /// The payload named a function or initializer the worker does not know
    UnknownFunction,
    /// Arguments or results could not be (de)serialized
    Serialization,
    /// The backend rejected the invocation with a non-retryable error
    FatalInvocation,
    /// The backend kept throttling until the attempt budget ran out
    ExhaustedRetries,
    /// The result did not materialize within the collection budget
    CollectionTimeout,
    /// The job was aborted before the call produced a result
    Cancelled,
    /// The worker or result store failed outside user code
    Internal,
}

impl CallErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function_error",
            Self::Initializer => "initializer_error",
            Self::UnknownFunction => "unknown_function",
            Self::Serialization => "serialization_error",
            Self::FatalInvocation => "fatal_invocation_error",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::CollectionTimeout => "collection_timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded for one call
///
/// Serializable so remote workers can hand it back through the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    /// Failure category
    pub kind: CallErrorKind,

    /// Human readable message
    pub message: String,

    /// Additional error details (for debugging)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CallError {
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Error raised by user code in the target function
    pub fn function(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Function, message)
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::new(CallErrorKind::Serialization, err.to_string())
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Re-tag an error raised while running an initializer
    pub(crate) fn in_initializer(mut self) -> Self {
        if self.kind == CallErrorKind::Function {
            self.kind = CallErrorKind::Initializer;
        }
        self
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        Self::function(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
