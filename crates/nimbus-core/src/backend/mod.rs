//! Compute backend capability
//!
//! Every platform adapter implements [`BackendClient`]. The invoker only
//! distinguishes three answers: an invocation id (accepted), `None`
//! (throttled or rejected for capacity, worth retrying) and a
//! [`BackendError`] (never retried).
//!
//! - [`IbmCfClient`] - OpenWhisk-compatible Cloud Functions REST client
//! - [`LocalBackend`] - In-process execution on the Tokio runtime

mod ibm_cf;
mod local;

pub use ibm_cf::IbmCfClient;
pub use local::LocalBackend;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, Config, ConfigError};
use crate::dispatch::CallPayload;
use crate::function::FunctionRegistry;
use crate::store::ResultStore;

/// Opaque id of an invocation accepted by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InvocationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Non-retryable backend failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Credentials were refused
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The payload or action was refused as invalid
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The request never got a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The response did not follow the platform protocol
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-platform invocation capability
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Submit one invocation
    ///
    /// Returns `Ok(None)` when the platform declined for capacity reasons.
    async fn invoke(
        &self,
        package: &str,
        action_name: &str,
        payload: &CallPayload,
    ) -> Result<Option<InvocationId>, BackendError>;

    /// Effective client settings, with secrets left out
    fn config(&self) -> serde_json::Value;
}

/// Build the bundled client for the configured backend
///
/// The localhost backend executes through `registry` and records outcomes in
/// `store`. Knative has no bundled client and must be supplied explicitly.
pub fn connect(
    config: &Config,
    store: Arc<dyn ResultStore>,
    registry: Arc<FunctionRegistry>,
) -> Result<Arc<dyn BackendClient>, ConfigError> {
    config.validate()?;

    match config.nimbus.backend {
        BackendKind::IbmCf => {
            let group = config
                .ibm_cf
                .as_ref()
                .ok_or(ConfigError::MissingGroup("ibm_cf"))?;
            Ok(Arc::new(IbmCfClient::from_config(group)?))
        }
        BackendKind::Localhost => {
            let max_inflight = config.localhost.as_ref().and_then(|l| l.max_inflight);
            let mut backend = LocalBackend::new(registry, store);
            if let Some(limit) = max_inflight {
                backend = backend.with_max_inflight(limit);
            }
            Ok(Arc::new(backend))
        }
        BackendKind::Knative => Err(ConfigError::UnsupportedBackend(BackendKind::Knative)),
    }
}
