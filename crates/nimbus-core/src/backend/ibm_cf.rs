//! IBM Cloud Functions client
//!
//! Non-blocking action invocation against the OpenWhisk REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{BackendClient, BackendError, InvocationId};
use crate::config::{ConfigError, IbmCfConfig};
use crate::dispatch::CallPayload;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ActivationResponse {
    #[serde(rename = "activationId")]
    activation_id: Option<String>,
}

/// OpenWhisk-compatible Cloud Functions client
pub struct IbmCfClient {
    client: Client,
    endpoint: String,
    namespace: String,
    user: String,
    password: String,
}

impl IbmCfClient {
    /// Create a client for an endpoint, used verbatim
    pub fn new(
        endpoint: impl Into<String>,
        namespace: impl Into<String>,
        api_key: &str,
    ) -> Result<Self, ConfigError> {
        let (user, password) = api_key.split_once(':').ok_or_else(|| {
            ConfigError::Invalid("ibm_cf.api_key must have the form 'user:password'".to_string())
        })?;

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Create a client from the `ibm_cf` configuration group
    ///
    /// Plain `http:` endpoints are upgraded to `https:`.
    pub fn from_config(config: &IbmCfConfig) -> Result<Self, ConfigError> {
        let missing = |key: &str| ConfigError::MissingKeys {
            group: "ibm_cf",
            keys: key.to_string(),
        };
        let endpoint = config.endpoint.as_deref().ok_or_else(|| missing("endpoint"))?;
        let namespace = config.namespace.as_deref().ok_or_else(|| missing("namespace"))?;
        let api_key = config.api_key.as_deref().ok_or_else(|| missing("api_key"))?;

        Self::new(upgrade_to_https(endpoint), namespace, api_key)
    }

    fn action_url(&self, package: &str, action_name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/actions/{}/{}",
            self.endpoint, self.namespace, package, action_name
        )
    }
}

fn upgrade_to_https(endpoint: &str) -> String {
    match endpoint.strip_prefix("http:") {
        Some(rest) => format!("https:{rest}"),
        None => endpoint.to_string(),
    }
}

#[async_trait]
impl BackendClient for IbmCfClient {
    fn name(&self) -> &'static str {
        "ibm_cf"
    }

    async fn invoke(
        &self,
        package: &str,
        action_name: &str,
        payload: &CallPayload,
    ) -> Result<Option<InvocationId>, BackendError> {
        let url = self.action_url(package, action_name);

        let response = self
            .client
            .post(&url)
            .query(&[("blocking", "false")])
            .basic_auth(&self.user, Some(&self.password))
            .json(payload)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::ACCEPTED => {
                let body: ActivationResponse = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                let activation_id = body.activation_id.ok_or_else(|| {
                    BackendError::Protocol("response is missing 'activationId'".to_string())
                })?;

                debug!(
                    action = %action_name,
                    activation_id = %activation_id,
                    "Action invoked"
                );
                Ok(Some(InvocationId::new(activation_id)))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::Unauthorized(format!("HTTP {status}: {body}")))
            }
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::PAYLOAD_TOO_LARGE => {
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::InvalidPayload(format!("HTTP {status}: {body}")))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                debug!(action = %action_name, "Invocation throttled");
                Ok(None)
            }
            s if s.is_server_error() => {
                warn!(action = %action_name, status = %s, "Backend unavailable");
                Ok(None)
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::Protocol(format!(
                    "unexpected HTTP {other}: {body}"
                )))
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "backend": self.name(),
            "endpoint": self.endpoint,
            "namespace": self.namespace,
        })
    }
}
