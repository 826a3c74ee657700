//! Runtime resolution
//!
//! Resolves the immutable execution environment (image, memory, timeout)
//! that every invocation of an executor session runs against.

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError, RUNTIME_MEMORY_DEFAULT, RUNTIME_TIMEOUT_DEFAULT};

/// Placeholder replaced by the backend account identifier
const USER_PLACEHOLDER: &str = "<USER>";

/// Default runtime image per host runtime version
///
/// The remote worker image must speak the same payload format as the
/// client, so images are keyed by the client's `major.minor` version.
pub const DEFAULT_RUNTIMES: &[(&str, &str)] = &[
    ("0.1", "<USER>/nimbus-kn-runtime-v01"),
    ("0.2", "<USER>/nimbus-kn-runtime-v02"),
];

/// Resolved execution environment
///
/// Created once per configuration load and shared read-only by all
/// invocations that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    /// Image name as configured (`{account}/{name}[:tag]`)
    pub runtime: String,

    /// Fully qualified reference (`{repository}/{account}/{name}:{tag}`)
    pub image_reference: String,

    /// Memory per invocation in MB
    pub memory_mb: u32,

    /// Invocation timeout in seconds
    pub timeout_seconds: u64,

    /// Registry host
    pub docker_repo: String,
}

impl RuntimeDescriptor {
    /// Remote action name for this runtime at its configured memory
    pub fn action_name(&self) -> String {
        format_action_name(&self.runtime, self.memory_mb)
    }

    /// Remote action name for this runtime at a specific memory tier
    pub fn action_name_for(&self, memory_mb: u32) -> String {
        format_action_name(&self.runtime, memory_mb)
    }
}

/// Derive the remote action name from a runtime and memory tier
///
/// Distinct memory tiers of one runtime map to distinct actions.
pub fn format_action_name(runtime: &str, memory_mb: u32) -> String {
    let runtime = runtime.replace(['/', ':'], "_");
    format!("{runtime}_{memory_mb}MB")
}

/// `major.minor` of a version string (`"0.2.7"` → `"0.2"`)
pub fn version_str(version: &str) -> Option<String> {
    let mut parts = version.trim().split('.');
    let major = parts.next().filter(|p| !p.is_empty())?;
    let minor = parts.next().filter(|p| !p.is_empty())?;
    Some(format!("{major}.{minor}"))
}

/// Version of this client, used to select a default runtime image
pub fn host_runtime_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    version_str(version).unwrap_or_else(|| version.to_string())
}

/// Resolves runtime descriptors from configuration
#[derive(Debug, Clone)]
pub struct RuntimeResolver {
    runtime_version: String,
}

impl RuntimeResolver {
    /// Resolver for an explicit runtime version
    pub fn new(runtime_version: impl Into<String>) -> Self {
        Self {
            runtime_version: runtime_version.into(),
        }
    }

    /// Resolver for the version of this client
    pub fn for_host() -> Self {
        Self::new(host_runtime_version())
    }

    /// Runtime version used to pick default images
    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    /// Resolve a descriptor
    ///
    /// Missing memory and timeout fall back to the documented defaults. A
    /// missing runtime image is derived from the version-keyed templates;
    /// an unknown version fails instead of guessing.
    pub fn resolve(&self, config: &Config) -> Result<RuntimeDescriptor, ConfigError> {
        config.validate()?;

        let execution = &config.nimbus;
        let memory_mb = execution.runtime_memory.unwrap_or(RUNTIME_MEMORY_DEFAULT);
        let timeout_seconds = execution.runtime_timeout.unwrap_or(RUNTIME_TIMEOUT_DEFAULT);
        let docker_repo = config.docker_repo();

        let runtime = match execution.runtime.as_deref().map(str::trim) {
            Some(runtime) if !runtime.is_empty() => runtime.to_string(),
            _ => self.default_runtime(&config.account_identifier()?)?,
        };

        let image_reference = image_reference(&docker_repo, &runtime);

        Ok(RuntimeDescriptor {
            runtime,
            image_reference,
            memory_mb,
            timeout_seconds,
            docker_repo,
        })
    }

    fn default_runtime(&self, account: &str) -> Result<String, ConfigError> {
        let version = version_str(&self.runtime_version)
            .ok_or_else(|| ConfigError::UnknownRuntimeVersion(self.runtime_version.clone()))?;

        DEFAULT_RUNTIMES
            .iter()
            .find(|(known, _)| *known == version)
            .map(|(_, template)| template.replace(USER_PLACEHOLDER, account))
            .ok_or(ConfigError::UnknownRuntimeVersion(version))
    }
}

fn image_reference(docker_repo: &str, runtime: &str) -> String {
    let name = runtime.rsplit('/').next().unwrap_or(runtime);
    let tagged = if name.contains(':') {
        runtime.to_string()
    } else {
        format!("{runtime}:latest")
    };
    format!("{}/{}", docker_repo.trim_end_matches('/'), tagged)
}
