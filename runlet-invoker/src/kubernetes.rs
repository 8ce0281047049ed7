use crate::models::Invocation;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::error::ErrorResponse;
use kube::{Client, Config};
use runlet_cfg::{Config as InvokerConfig, KubernetesOptions, ResourceDefaults};
use serde_json::{json, Map, Value};
use std::convert::TryFrom;
use std::env;
use thiserror::Error;

const MANAGED_BY: &str = "runlet.io";
const FINALIZER_INVOCATION_PROTECTION: &str = "runlet.io/invocation-protection";

/// Failures at the Kubernetes boundary. Not-found and conflict are not
/// failures; they surface as `Option` and `PodCreation` respectively.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Kubernetes API request failed: {0}")]
    Unavailable(String),
}

/// Outcome of a pod creation attempt. A name conflict means some
/// earlier pass already created the pod, which is just as good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodCreation {
    Created,
    AlreadyExists,
}

/// Pod operations scoped to the configured namespace.
#[derive(Clone)]
pub struct PodClient {
    pods: Api<Pod>,
    pub namespace: String,
}

impl PodClient {
    /// Connect following the configured selectors: inline kubeconfig
    /// YAML, kubeconfig file, in-cluster discovery, or the default
    /// kubeconfig resolution, in that order.
    pub async fn connect(options: &KubernetesOptions) -> Result<Self> {
        let context_options = KubeConfigOptions {
            context: options.context.clone(),
            cluster: options.cluster.clone(),
            user: options.user.clone(),
        };

        let config = if let Some(yaml) = &options.yaml {
            let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml).context("Inline kubeconfig is not valid YAML.")?;
            Config::from_custom_kubeconfig(kubeconfig, &context_options).await?
        } else if let Some(file) = &options.file {
            let kubeconfig = Kubeconfig::read_from(file).with_context(|| format!("Failed to read kubeconfig: {}", file))?;
            Config::from_custom_kubeconfig(kubeconfig, &context_options).await?
        } else if env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            Config::from_cluster_env().context("Failed to load in-cluster Kubernetes configuration.")?
        } else {
            Config::from_kubeconfig(&context_options)
                .await
                .context("Failed to load default kubeconfig.")?
        };

        let namespace = options.namespace.clone().unwrap_or_else(|| config.default_ns.clone());
        let client = Client::try_from(config).context("Failed to create Kubernetes client.")?;

        Ok(PodClient {
            pods: Api::namespaced(client, &namespace),
            namespace,
        })
    }

    /// Read a pod by name; absence is a normal outcome.
    pub async fn read_pod(&self, name: &str) -> Result<Option<Pod>, KubeError> {
        match self.pods.get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(error) => Err(KubeError::Unavailable(error.to_string())),
        }
    }

    ///
    ///
    ///
    pub async fn create_pod(&self, pod: &Pod) -> Result<PodCreation, KubeError> {
        match self.pods.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(PodCreation::Created),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Ok(PodCreation::AlreadyExists),
            Err(error) => Err(KubeError::Unavailable(error.to_string())),
        }
    }
}

/// Build the pod template for an invocation.
///
/// Every identity field is a deterministic function of the invocation,
/// so repeated passes produce the same pod name and the creation
/// conflict path can do its job.
pub fn pod_template(config: &InvokerConfig, invocation: &Invocation, token: &str) -> Result<Pod> {
    let mut env = vec![
        json!({ "name": "RUNLET_URL", "value": config.api_url }),
        json!({ "name": "RUNLET_TOKEN", "value": token }),
        json!({ "name": "RUNLET_INVOCATION_ID", "value": invocation.ulid }),
    ];

    if invocation.runtime_test.unwrap_or(false) {
        env.push(json!({ "name": "RUNLET_MODE", "value": "test" }));
    }

    for item in &invocation.env {
        // Secret references are passed through as references, never resolved.
        let entry = match (&item.secret_name, &item.secret_key) {
            (Some(name), Some(key)) => json!({
                "name": item.name,
                "valueFrom": {
                    "secretKeyRef": {
                        "name": name,
                        "key": key,
                    }
                }
            }),
            _ => json!({ "name": item.name, "value": item.value }),
        };

        env.push(entry);
    }

    let image_pull_policy = if invocation.image.tag == "latest" {
        "Always"
    } else {
        "IfNotPresent"
    };

    let image_pull_secrets: Vec<Value> = config
        .image_pull_secrets
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    let pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": invocation.pod,
            "labels": {
                "app.kubernetes.io/managed-by": MANAGED_BY,
                "runlet.io/function-name": invocation.function_name,
                "runlet.io/invocation-ulid": invocation.ulid,
                "runlet.io/project": invocation.project,
            },
            "finalizers": [FINALIZER_INVOCATION_PROTECTION],
        },
        "spec": {
            "automountServiceAccountToken": false,
            "restartPolicy": "Never",
            "containers": [{
                "name": "job",
                "image": invocation.image.reference(),
                "imagePullPolicy": image_pull_policy,
                "env": env,
                "resources": resources_section(invocation, &config.resources),
            }],
            "imagePullSecrets": image_pull_secrets,
        }
    }))
    .context("Failed to construct pod template.")?;

    Ok(pod)
}

///
///
///
fn resources_section(invocation: &Invocation, defaults: &ResourceDefaults) -> Value {
    let declared = invocation.resources.as_ref();
    let requests = declared.and_then(|r| r.requests.as_ref());
    let limits = declared.and_then(|r| r.limits.as_ref());

    let cpu_request = requests.and_then(|r| r.cpu.clone()).or_else(|| defaults.cpu_request.clone());
    let memory_request = requests.and_then(|r| r.memory.clone()).or_else(|| defaults.memory_request.clone());
    let cpu_limit = limits.and_then(|l| l.cpu.clone()).or_else(|| defaults.cpu_limit.clone());
    let memory_limit = limits.and_then(|l| l.memory.clone()).or_else(|| defaults.memory_limit.clone());

    let mut resources = Map::new();
    if let Some(section) = quantities(cpu_request, memory_request) {
        resources.insert(String::from("requests"), section);
    }
    if let Some(section) = quantities(cpu_limit, memory_limit) {
        resources.insert(String::from("limits"), section);
    }

    Value::Object(resources)
}

///
///
///
fn quantities(cpu: Option<String>, memory: Option<String>) -> Option<Value> {
    let mut section = Map::new();
    if let Some(cpu) = cpu {
        section.insert(String::from("cpu"), Value::String(cpu));
    }
    if let Some(memory) = memory {
        section.insert(String::from("memory"), Value::String(memory));
    }

    if section.is_empty() {
        None
    } else {
        Some(Value::Object(section))
    }
}
