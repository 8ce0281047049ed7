use crate::api::{ApiClient, StoreError};
use crate::kubernetes::{pod_template, KubeError, PodClient, PodCreation};
use crate::models::{Invocation, InvocationStatus};
use crate::token::{self, TokenKey};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use runlet_cfg::Config;
use std::convert::TryFrom;
use std::sync::Arc;

/// Grace period before an `initializing` invocation is considered
/// crashed. The pod accepted work but never acknowledged progress, so
/// the invocation's own timeout doesn't apply yet.
const INITIALIZING_GRACE_SECONDS: i64 = 600;

/// Store operations the engine depends on.
#[async_trait]
pub trait InvocationStore {
    async fn list_active(&self, limit: usize) -> Result<Vec<Invocation>, StoreError>;
    async fn fail_timed_out(&self, invocation: &Invocation) -> Result<(), StoreError>;
}

/// Pod operations the engine depends on.
#[async_trait]
pub trait PodScheduler {
    async fn read_pod(&self, name: &str) -> Result<Option<Pod>, KubeError>;
    async fn create_pod(&self, pod: &Pod) -> Result<PodCreation, KubeError>;
}

#[async_trait]
impl InvocationStore for ApiClient {
    async fn list_active(&self, limit: usize) -> Result<Vec<Invocation>, StoreError> {
        ApiClient::list_active(self, limit).await
    }

    async fn fail_timed_out(&self, invocation: &Invocation) -> Result<(), StoreError> {
        ApiClient::fail_timed_out(self, invocation).await
    }
}

#[async_trait]
impl PodScheduler for PodClient {
    async fn read_pod(&self, name: &str) -> Result<Option<Pod>, KubeError> {
        PodClient::read_pod(self, name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<PodCreation, KubeError> {
        PodClient::create_pod(self, pod).await
    }
}

/// The reconciliation engine. Holds no state between passes; every
/// pass re-evaluates the candidates from scratch.
pub struct Invoker<S, K> {
    config: Arc<Config>,
    store: S,
    kubernetes: K,
    token_key: TokenKey,
}

impl<S, K> Invoker<S, K>
where
    S: InvocationStore,
    K: PodScheduler,
{
    ///
    ///
    ///
    pub fn new(config: Arc<Config>, store: S, kubernetes: K, token_key: TokenKey) -> Self {
        Invoker {
            config,
            store,
            kubernetes,
            token_key,
        }
    }

    /// Run a single reconciliation pass.
    ///
    /// A listing failure aborts the pass before any other call is made.
    /// Past that point, candidates are reconciled concurrently and a
    /// failure on one never affects its siblings.
    pub async fn run_once(&self) -> Result<(), StoreError> {
        let invocations = self.store.list_active(self.config.max_active_invocations).await?;
        debug!("Reconciling {} invocation(s).", invocations.len());

        let results = futures::future::join_all(
            invocations.iter().map(|invocation| self.reconcile(invocation)),
        )
        .await;

        for (invocation, result) in invocations.iter().zip(results) {
            if let Err(error) = result {
                error!("Failed to reconcile invocation '{}': {:?}", invocation.ulid, error);
            }
        }

        Ok(())
    }

    ///
    ///
    ///
    async fn reconcile(&self, invocation: &Invocation) -> Result<()> {
        if has_timed_out(invocation) {
            debug!("Invocation '{}' timed out.", invocation.ulid);
            self.store.fail_timed_out(invocation).await?;
            return Ok(());
        }

        if invocation.status != InvocationStatus::Pending {
            trace!("Ignoring invocation '{}' ({}).", invocation.ulid, invocation.status);
            return Ok(());
        }

        if self.kubernetes.read_pod(&invocation.pod).await?.is_some() {
            return Ok(());
        }

        let token = token::sign_pod_token(&self.token_key, &invocation.pod)?;
        let template = pod_template(&self.config, invocation, &token.raw)?;

        debug!("Creating pod '{}' for invocation '{}'.", invocation.pod, invocation.ulid);
        match self.kubernetes.create_pod(&template).await? {
            PodCreation::Created => {}
            PodCreation::AlreadyExists => trace!("Pod '{}' already created.", invocation.pod),
        }

        Ok(())
    }
}

/// Whether an invocation is genuinely stuck.
///
/// Only `initializing` and `running` invocations can time out, both
/// measured from the last recorded phase transition. The `initializing`
/// check deliberately ignores the declared timeout, which applies to
/// the `running` phase alone.
pub fn has_timed_out(invocation: &Invocation) -> bool {
    let last_phase = match invocation.last_phase() {
        Some(phase) => phase,
        None => return false,
    };

    match invocation.status {
        InvocationStatus::Initializing => elapsed_at_least(&last_phase.date, INITIALIZING_GRACE_SECONDS),
        InvocationStatus::Running => match invocation.timeout.and_then(|timeout| i64::try_from(timeout).ok()) {
            Some(timeout) => elapsed_at_least(&last_phase.date, timeout),
            // No declared timeout, or one too large to ever be reached.
            None => false,
        },
        _ => false,
    }
}

/// Whether at least `seconds` whole seconds passed since `date`.
fn elapsed_at_least(date: &DateTime<Utc>, seconds: i64) -> bool {
    Utc::now().signed_duration_since(*date).num_seconds() >= seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvocationImage, InvocationPhase, PhaseStatus};
    use chrono::Duration;

    fn invocation(status: InvocationStatus, phase_age_seconds: i64, timeout: Option<u64>) -> Invocation {
        let phase_status = match status {
            InvocationStatus::Pending => PhaseStatus::Pending,
            InvocationStatus::Initializing => PhaseStatus::Initializing,
            InvocationStatus::Running => PhaseStatus::Running,
            InvocationStatus::Completed => PhaseStatus::Completed,
            InvocationStatus::Failed => PhaseStatus::Failed,
        };

        Invocation {
            rev: String::from("1-abc"),
            ulid: String::from("01h455vb4pex5vsknk084sn02q"),
            status,
            result: None,
            reason: None,
            phases: vec![InvocationPhase {
                status: phase_status,
                date: Utc::now() - Duration::seconds(phase_age_seconds),
                pod: String::from("fn-test-01h455"),
                reason: None,
            }],
            function_name: String::from("test"),
            image: InvocationImage {
                host: String::from("registry.local"),
                name: String::from("fn-test"),
                tag: String::from("1.0.0"),
            },
            env: vec![],
            project: String::from("default"),
            runtime_test: None,
            resources: None,
            pod: String::from("fn-test-01h455"),
            retries: None,
            timeout,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn initializing_times_out_after_grace_period() {
        assert!(!has_timed_out(&invocation(InvocationStatus::Initializing, 599, None)));
        assert!(has_timed_out(&invocation(InvocationStatus::Initializing, 601, None)));
    }

    #[test]
    fn initializing_ignores_declared_timeout() {
        // The declared timeout applies to the running phase only.
        assert!(!has_timed_out(&invocation(InvocationStatus::Initializing, 30, Some(10))));
    }

    #[test]
    fn running_times_out_against_declared_timeout() {
        assert!(has_timed_out(&invocation(InvocationStatus::Running, 15, Some(10))));
        assert!(!has_timed_out(&invocation(InvocationStatus::Running, 5, Some(10))));
    }

    #[test]
    fn running_times_out_at_the_exact_deadline() {
        assert!(has_timed_out(&invocation(InvocationStatus::Running, 10, Some(10))));
    }

    #[test]
    fn running_without_timeout_never_times_out() {
        assert!(!has_timed_out(&invocation(InvocationStatus::Running, 86_400, None)));
    }

    #[test]
    fn unrepresentable_timeout_never_times_out() {
        // Seconds values beyond the calendar range must not panic the pass.
        assert!(!has_timed_out(&invocation(InvocationStatus::Running, 86_400, Some(9_300_000_000_000_000))));
        assert!(!has_timed_out(&invocation(InvocationStatus::Running, 86_400, Some(u64::MAX))));
    }

    #[test]
    fn other_statuses_never_time_out() {
        assert!(!has_timed_out(&invocation(InvocationStatus::Pending, 86_400, Some(10))));
        assert!(!has_timed_out(&invocation(InvocationStatus::Completed, 86_400, Some(10))));
        assert!(!has_timed_out(&invocation(InvocationStatus::Failed, 86_400, Some(10))));
    }

    #[test]
    fn missing_phases_never_time_out() {
        let mut invocation = invocation(InvocationStatus::Initializing, 86_400, None);
        invocation.phases.clear();

        assert!(!has_timed_out(&invocation));
    }
}
