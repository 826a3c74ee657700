//! Executor configuration
//!
//! A nested document with one execution group (`nimbus`) and one group per
//! compute backend. It is loaded from JSON or from environment variables and
//! validated before any invocation is attempted.
//!
//! ```json
//! {
//!   "nimbus": {
//!     "backend": "knative",
//!     "runtime_memory": 512,
//!     "invocation_retry": true,
//!     "retries": 3,
//!     "retry_sleeps": [1, 5]
//!   },
//!   "knative": { "docker_user": "alice", "docker_token": "..." }
//! }
//! ```

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Memory assigned to a runtime when the configuration omits it (MB)
pub const RUNTIME_MEMORY_DEFAULT: u32 = 256;

/// Runtime timeout when the configuration omits it (seconds)
pub const RUNTIME_TIMEOUT_DEFAULT: u64 = 600;

/// Container registry used when the backend group omits `docker_repo`
pub const DOCKER_REPO_DEFAULT: &str = "docker.io";

/// Maximum invocation attempts per call (including the first)
pub const RETRIES_DEFAULT: u32 = 5;

/// Candidate backoff sleeps in seconds
pub const RETRY_SLEEPS_DEFAULT: [u64; 5] = [1, 5, 10, 15, 20];

/// Concurrent submissions allowed against the backend invocation API
pub const MAX_CONCURRENCY_DEFAULT: usize = 64;

/// Interval between result-store polls (milliseconds)
pub const POLL_INTERVAL_MS_DEFAULT: u64 = 500;

/// Extra collection slack on top of the runtime timeout (seconds)
pub const COLLECT_SLACK_SECS: u64 = 10;

/// Configuration errors
///
/// These are fatal and surface before any call is submitted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A backend group required by `nimbus.backend` is absent
    #[error("missing configuration group '{0}'")]
    MissingGroup(&'static str),

    /// Required keys are absent from a group
    #[error("you must provide {keys} to access {group}")]
    MissingKeys { group: &'static str, keys: String },

    /// No runtime image could be determined for the host runtime version
    #[error("no default runtime image for runtime version {0}; set 'nimbus.runtime' explicitly")]
    UnknownRuntimeVersion(String),

    /// A value is present but unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The selected backend has no bundled client
    #[error("backend '{0}' has no bundled client; supply one explicitly")]
    UnsupportedBackend(BackendKind),

    /// Environment variable could not be parsed
    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },

    /// Document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Document could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute backend selected by `nimbus.backend`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// IBM Cloud Functions (OpenWhisk REST API)
    IbmCf,
    /// Knative serving
    Knative,
    /// In-process execution on the local Tokio runtime
    Localhost,
}

impl BackendKind {
    /// Configuration group name for this backend
    pub fn group(self) -> &'static str {
        match self {
            Self::IbmCf => "ibm_cf",
            Self::Knative => "knative",
            Self::Localhost => "localhost",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.group())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ibm_cf" => Ok(Self::IbmCf),
            "knative" => Ok(Self::Knative),
            "localhost" => Ok(Self::Localhost),
            other => Err(ConfigError::Invalid(format!("unknown backend '{other}'"))),
        }
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Generic execution settings
    pub nimbus: ExecutionConfig,

    /// IBM Cloud Functions settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ibm_cf: Option<IbmCfConfig>,

    /// Knative settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knative: Option<KnativeConfig>,

    /// Localhost settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localhost: Option<LocalhostConfig>,
}

/// Generic execution group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Compute backend
    pub backend: BackendKind,

    /// Runtime image name (`{account}/{name}[:tag]`); derived when absent
    #[serde(default)]
    pub runtime: Option<String>,

    /// Memory per invocation (MB)
    #[serde(default)]
    pub runtime_memory: Option<u32>,

    /// Invocation timeout (seconds)
    #[serde(default)]
    pub runtime_timeout: Option<u64>,

    /// Whether throttled invocations are retried
    #[serde(default = "default_invocation_retry")]
    pub invocation_retry: bool,

    /// Maximum invocation attempts per call
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Candidate backoff sleeps (seconds)
    #[serde(default = "default_retry_sleeps")]
    pub retry_sleeps: Vec<u64>,

    /// Concurrent submissions against the backend
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Time budget for exhausting retries on one call (seconds)
    #[serde(default)]
    pub invoke_timeout: Option<u64>,

    /// Wait budget for result collection (seconds)
    #[serde(default)]
    pub collect_timeout: Option<u64>,

    /// Result-store poll interval (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ExecutionConfig {
    /// Execution group with defaults for everything except the backend
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            runtime: None,
            runtime_memory: None,
            runtime_timeout: None,
            invocation_retry: default_invocation_retry(),
            retries: default_retries(),
            retry_sleeps: default_retry_sleeps(),
            max_concurrency: default_max_concurrency(),
            invoke_timeout: None,
            collect_timeout: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Invoker time budget, if configured
    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout.map(Duration::from_secs)
    }

    /// Result-store poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// IBM Cloud Functions group
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IbmCfConfig {
    /// API endpoint (e.g. `https://us-south.functions.cloud.ibm.com`)
    pub endpoint: Option<String>,
    /// Namespace holding the actions
    pub namespace: Option<String>,
    /// `user:password` API key
    pub api_key: Option<String>,
}

/// Knative group
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnativeConfig {
    /// Registry account that owns the runtime images
    pub docker_user: Option<String>,
    /// Registry access token
    pub docker_token: Option<String>,
    /// Registry host
    #[serde(default)]
    pub docker_repo: Option<String>,
    /// Ingress endpoint of the serving cluster
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Localhost group
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalhostConfig {
    /// Concurrent executions accepted before invocations are throttled
    #[serde(default)]
    pub max_inflight: Option<usize>,
}

fn default_invocation_retry() -> bool {
    true
}

fn default_retries() -> u32 {
    RETRIES_DEFAULT
}

fn default_retry_sleeps() -> Vec<u64> {
    RETRY_SLEEPS_DEFAULT.to_vec()
}

fn default_max_concurrency() -> usize {
    MAX_CONCURRENCY_DEFAULT
}

fn default_poll_interval_ms() -> u64 {
    POLL_INTERVAL_MS_DEFAULT
}

impl Config {
    /// Configuration for a backend with all generic defaults
    pub fn new(backend: BackendKind) -> Self {
        Self {
            nimbus: ExecutionConfig::new(backend),
            ibm_cf: None,
            knative: None,
            localhost: None,
        }
    }

    /// Localhost configuration; needs no credentials
    pub fn localhost() -> Self {
        let mut config = Self::new(BackendKind::Localhost);
        config.localhost = Some(LocalhostConfig::default());
        config
    }

    /// Parse a JSON document
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Parse a JSON value (e.g. produced by an external loader)
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json_str(&document)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `NIMBUS_BACKEND`: `ibm_cf`, `knative` or `localhost` (default: localhost)
    /// - `NIMBUS_RUNTIME`: runtime image name
    /// - `NIMBUS_RUNTIME_MEMORY`: memory in MB
    /// - `NIMBUS_RUNTIME_TIMEOUT`: timeout in seconds
    /// - `NIMBUS_INVOCATION_RETRY`: `true`/`false` (also `1`/`0`, `yes`/`no`, `on`/`off`)
    /// - `NIMBUS_RETRIES`: maximum attempts per call
    /// - `NIMBUS_RETRY_SLEEPS`: comma separated seconds, e.g. `1,5,10`
    /// - `NIMBUS_MAX_CONCURRENCY`: concurrent submissions
    /// - `IBM_CF_ENDPOINT`, `IBM_CF_NAMESPACE`, `IBM_CF_API_KEY`
    /// - `KNATIVE_DOCKER_USER`, `KNATIVE_DOCKER_TOKEN`, `KNATIVE_DOCKER_REPO`, `KNATIVE_ENDPOINT`
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match env::var("NIMBUS_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => BackendKind::Localhost,
        };

        let mut config = Self::new(backend);
        let nimbus = &mut config.nimbus;
        nimbus.runtime = env::var("NIMBUS_RUNTIME").ok().filter(|v| !v.is_empty());
        nimbus.runtime_memory = parse_env("NIMBUS_RUNTIME_MEMORY")?;
        nimbus.runtime_timeout = parse_env("NIMBUS_RUNTIME_TIMEOUT")?;
        if let Some(retry) = parse_env::<String>("NIMBUS_INVOCATION_RETRY")? {
            nimbus.invocation_retry = parse_flag("NIMBUS_INVOCATION_RETRY", &retry)?;
        }
        if let Some(retries) = parse_env("NIMBUS_RETRIES")? {
            nimbus.retries = retries;
        }
        if let Some(sleeps) = parse_env::<String>("NIMBUS_RETRY_SLEEPS")? {
            nimbus.retry_sleeps = sleeps
                .split(',')
                .map(|s| s.trim().parse::<u64>())
                .collect::<Result<_, _>>()
                .map_err(|e| ConfigError::Env {
                    var: "NIMBUS_RETRY_SLEEPS",
                    message: e.to_string(),
                })?;
        }
        if let Some(max) = parse_env("NIMBUS_MAX_CONCURRENCY")? {
            nimbus.max_concurrency = max;
        }

        config.ibm_cf = Some(IbmCfConfig {
            endpoint: env::var("IBM_CF_ENDPOINT").ok(),
            namespace: env::var("IBM_CF_NAMESPACE").ok(),
            api_key: env::var("IBM_CF_API_KEY").ok(),
        })
        .filter(|c| c.endpoint.is_some() || c.namespace.is_some() || c.api_key.is_some());

        config.knative = Some(KnativeConfig {
            docker_user: env::var("KNATIVE_DOCKER_USER").ok(),
            docker_token: env::var("KNATIVE_DOCKER_TOKEN").ok(),
            docker_repo: env::var("KNATIVE_DOCKER_REPO").ok(),
            endpoint: env::var("KNATIVE_ENDPOINT").ok(),
        })
        .filter(|c| c.docker_user.is_some() || c.docker_token.is_some());

        if backend == BackendKind::Localhost {
            config.localhost = Some(LocalhostConfig::default());
        }

        Ok(config)
    }

    /// Validate the document
    ///
    /// Checks the backend group and its credentials plus the generic
    /// execution settings. Runtime image resolution is checked separately by
    /// the runtime resolver.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.account_identifier()?;

        if self.nimbus.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "nimbus.max_concurrency must be a positive integer".to_string(),
            ));
        }

        if self.nimbus.runtime_memory == Some(0) {
            return Err(ConfigError::Invalid(
                "nimbus.runtime_memory must be a positive integer".to_string(),
            ));
        }

        if self.nimbus.invocation_retry
            && self.nimbus.retries > 1
            && self.nimbus.retry_sleeps.is_empty()
        {
            return Err(ConfigError::Invalid(
                "nimbus.retry_sleeps cannot be empty when retries are enabled".to_string(),
            ));
        }

        if self.nimbus.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "nimbus.poll_interval_ms must be a positive integer".to_string(),
            ));
        }

        Ok(())
    }

    /// Account identifier substituted into default runtime image names
    ///
    /// Fails if the selected backend's group or credentials are absent.
    pub fn account_identifier(&self) -> Result<String, ConfigError> {
        match self.nimbus.backend {
            BackendKind::IbmCf => {
                let group = self
                    .ibm_cf
                    .as_ref()
                    .ok_or(ConfigError::MissingGroup("ibm_cf"))?;
                require(
                    "ibm_cf",
                    &[
                        ("endpoint", &group.endpoint),
                        ("namespace", &group.namespace),
                        ("api_key", &group.api_key),
                    ],
                )?;
                Ok(group.namespace.clone().unwrap_or_default())
            }
            BackendKind::Knative => {
                let group = self
                    .knative
                    .as_ref()
                    .ok_or(ConfigError::MissingGroup("knative"))?;
                require(
                    "knative",
                    &[
                        ("docker_user", &group.docker_user),
                        ("docker_token", &group.docker_token),
                    ],
                )?;
                Ok(group.docker_user.clone().unwrap_or_default())
            }
            BackendKind::Localhost => Ok("local".to_string()),
        }
    }

    /// Registry host for runtime images
    pub fn docker_repo(&self) -> String {
        self.knative
            .as_ref()
            .and_then(|k| k.docker_repo.clone())
            .filter(|repo| !repo.trim().is_empty())
            .unwrap_or_else(|| DOCKER_REPO_DEFAULT.to_string())
    }
}

fn require(group: &'static str, keys: &[(&str, &Option<String>)]) -> Result<(), ConfigError> {
    let missing: Vec<&str> = keys
        .iter()
        .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingKeys {
            group,
            keys: missing.join(", "),
        })
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Env {
                    var,
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var,
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}
