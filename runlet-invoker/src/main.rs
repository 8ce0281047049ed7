use anyhow::{Context, Result};
use clap::Clap;
use dotenv::dotenv;
use log::LevelFilter;
use log::{debug, error, info, warn};
use runlet_cfg::{Config, KubernetesOptions, ResourceDefaults};
use runlet_invoker::api::ApiClient;
use runlet_invoker::invoke::Invoker;
use runlet_invoker::kubernetes::PodClient;
use runlet_invoker::token;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time;

/// Grace period for the in-flight pass once shutdown is requested.
const SHUTDOWN_GRACE_SECONDS: u64 = 10;

#[derive(Clap)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Opts {
    /// Runlet API base URL
    #[clap(short, long, env = "API_URL")]
    api_url: String,
    /// Print debug info
    #[clap(short, long, env = "DEBUG", takes_value = false)]
    debug: bool,
    /// Seconds between reconciliation passes
    #[clap(short, long, default_value = "10", env = "INVOKE_TIMEOUT")]
    interval: u64,
    /// Maximum invocations handled per pass
    #[clap(short, long, default_value = "10", env = "MAX_ACTIVE_INVOCATIONS")]
    max_active_invocations: usize,
    /// Symmetric JWT secret
    #[clap(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,
    /// PKCS#8 PEM filepath of the JWT private key
    #[clap(long, env = "JWT_PRIVATE_KEY")]
    jwt_private_key: Option<String>,
    /// Kubeconfig filepath
    #[clap(long, env = "K8S_FILE")]
    k8s_file: Option<String>,
    /// Inline kubeconfig YAML
    #[clap(long, env = "K8S_YAML")]
    k8s_yaml: Option<String>,
    /// Kubernetes namespace to create pods in
    #[clap(long, env = "K8S_NAMESPACE")]
    k8s_namespace: Option<String>,
    /// Required kubeconfig context name
    #[clap(long, env = "K8S_CONTEXT")]
    k8s_context: Option<String>,
    /// Required kubeconfig context cluster
    #[clap(long, env = "K8S_CLUSTER")]
    k8s_cluster: Option<String>,
    /// Required kubeconfig context user
    #[clap(long, env = "K8S_USER")]
    k8s_user: Option<String>,
    /// Comma-separated image pull secret names
    #[clap(long, env = "K8S_PULL_SECRETS")]
    k8s_pull_secrets: Option<String>,
    /// Fallback cpu request for invocation pods
    #[clap(long, env = "K8S_CPU_REQUEST")]
    k8s_cpu_request: Option<String>,
    /// Fallback memory request for invocation pods
    #[clap(long, env = "K8S_MEMORY_REQUEST")]
    k8s_memory_request: Option<String>,
    /// Fallback cpu limit for invocation pods
    #[clap(long, env = "K8S_CPU_LIMIT")]
    k8s_cpu_limit: Option<String>,
    /// Fallback memory limit for invocation pods
    #[clap(long, env = "K8S_MEMORY_LIMIT")]
    k8s_memory_limit: Option<String>,
}

impl Opts {
    ///
    ///
    ///
    fn into_config(self) -> Config {
        let image_pull_secrets = self
            .k8s_pull_secrets
            .map(|secrets| secrets.split(',').map(String::from).collect())
            .unwrap_or_default();

        Config {
            api_url: self.api_url,
            max_active_invocations: self.max_active_invocations,
            invoke_interval: self.interval,
            image_pull_secrets,
            resources: ResourceDefaults {
                cpu_request: self.k8s_cpu_request,
                memory_request: self.k8s_memory_request,
                cpu_limit: self.k8s_cpu_limit,
                memory_limit: self.k8s_memory_limit,
            },
            kubernetes: KubernetesOptions {
                file: self.k8s_file,
                yaml: self.k8s_yaml,
                namespace: self.k8s_namespace,
                context: self.k8s_context,
                cluster: self.k8s_cluster,
                user: self.k8s_user,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let opts = Opts::parse();

    // Configure logger.
    let mut logger = env_logger::builder();
    logger.format_module_path(false);

    if opts.debug {
        logger.filter_level(LevelFilter::Debug).init();
    } else {
        logger.filter_level(LevelFilter::Info).init();
    }

    let jwt_secret = opts.jwt_secret.clone();
    let jwt_private_key = opts.jwt_private_key.clone();

    let config = Arc::new(opts.into_config());
    config.validate()?;

    debug!("Import JWT signing key.");
    let token_key = token::import_key(jwt_secret.as_deref(), jwt_private_key.as_deref())?;

    let store = ApiClient::new(&config.api_url, token_key.clone())?;

    debug!("Probe the runlet API.");
    store
        .list_active(1)
        .await
        .context("Failed to reach the runlet API.")?;

    let kubernetes = PodClient::connect(&config.kubernetes).await?;
    info!("Creating invocation pods in namespace '{}'.", kubernetes.namespace);

    let invoker = Arc::new(Invoker::new(config.clone(), store, kubernetes, token_key));

    run(invoker, config.invoke_interval).await
}

/// Drive reconciliation passes on a fixed interval.
///
/// At most one pass runs at a time: a tick that fires while the
/// previous pass is still in flight is dropped, not queued. On a close
/// signal the loop stops scheduling immediately and the in-flight pass
/// gets a bounded grace period to finish.
async fn run(
    invoker: Arc<Invoker<ApiClient, PodClient>>,
    interval_seconds: u64,
) -> Result<()> {
    let mut interval = time::interval(Duration::from_secs(interval_seconds));
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if in_flight.as_ref().map(|pass| !pass.is_finished()).unwrap_or(false) {
                    warn!("Invoker is busy; skipping this pass.");
                    continue;
                }

                let invoker = invoker.clone();
                in_flight = Some(tokio::spawn(async move {
                    debug!("Invoke pods.");
                    if let Err(error) = invoker.run_once().await {
                        error!("Reconciliation pass failed: {}", error);
                    }
                }));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt signal.");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received terminate signal.");
                break;
            }
        }
    }

    if let Some(pass) = in_flight {
        if !pass.is_finished() {
            info!("Waiting for the in-flight pass to finish.");
            if time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECONDS), pass)
                .await
                .is_err()
            {
                warn!("Grace period expired; abandoning the in-flight pass.");
            }
        }
    }

    Ok(())
}
