#[macro_use]
extern crate anyhow;

use anyhow::Result;
use url::Url;

/// Upper bound on the number of invocations handled in a single pass.
pub const MAX_ACTIVE_INVOCATIONS_LIMIT: usize = 100;

/// Immutable invoker settings, assembled once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the runlet API.
    pub api_url: String,
    /// Maximum number of invocations fetched and reconciled per pass.
    pub max_active_invocations: usize,
    /// Seconds between reconciliation passes.
    pub invoke_interval: u64,
    /// Names of image pull secrets attached to every invocation pod.
    pub image_pull_secrets: Vec<String>,
    pub resources: ResourceDefaults,
    pub kubernetes: KubernetesOptions,
}

impl Config {
    ///
    ///
    ///
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_url)
            .map_err(|_| anyhow!("Runlet API URL '{}' is not a valid URL.", self.api_url))?;

        ensure!(
            self.max_active_invocations >= 1,
            "Max active invocations must be a positive integer."
        );
        ensure!(
            self.max_active_invocations <= MAX_ACTIVE_INVOCATIONS_LIMIT,
            "Max active invocations may not exceed {}.",
            MAX_ACTIVE_INVOCATIONS_LIMIT
        );
        ensure!(self.invoke_interval >= 1, "Invoke interval must be a positive integer.");

        Ok(())
    }
}

/// Fallback resource requests/limits, applied per field when an
/// invocation doesn't declare its own.
#[derive(Clone, Debug, Default)]
pub struct ResourceDefaults {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

/// Kubernetes connection selectors.
#[derive(Clone, Debug, Default)]
pub struct KubernetesOptions {
    /// Kubeconfig filepath.
    pub file: Option<String>,
    /// Inline kubeconfig YAML.
    pub yaml: Option<String>,
    pub namespace: Option<String>,
    /// Required kubeconfig context name.
    pub context: Option<String>,
    /// Required kubeconfig context cluster.
    pub cluster: Option<String>,
    /// Required kubeconfig context user.
    pub user: Option<String>,
}
