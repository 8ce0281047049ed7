use crate::models::{Invocation, InvocationStatus};
use crate::token::{self, TokenKey};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Reason recorded on invocations failed by the timeout path.
pub const REASON_TIMED_OUT: &str = "timed out";

const REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Failures at the store boundary, classified so callers branch on an
/// enumerated outcome instead of inspecting response objects.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Listing failed; the whole pass is aborted, no partial results
    /// are trusted.
    #[error("Invocations list failed: {0}")]
    Unavailable(String),
    /// The timeout report failed, either on transport, status code, or
    /// the `if-match` precondition. The write must not be assumed to
    /// have succeeded partially.
    #[error("Invocation '{ulid}' update failed: {detail}")]
    UpdateFailed { ulid: String, detail: String },
}

/// Authenticated HTTP client for the runlet API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
    token_key: TokenKey,
}

impl ApiClient {
    ///
    ///
    ///
    pub fn new(api_url: &str, token_key: TokenKey) -> Result<Self> {
        let base_url = Url::parse(api_url).with_context(|| format!("Invalid runlet API URL: {}", api_url))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .context("Failed to create HTTP client.")?;

        Ok(ApiClient {
            base_url,
            client,
            token_key,
        })
    }

    /// List invocations that are not yet terminal, oldest first.
    pub async fn list_active(&self, limit: usize) -> Result<Vec<Invocation>, StoreError> {
        let token = token::sign_invoker_token(&self.token_key)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        let url = self
            .base_url
            .join("/api/v1/invocations")
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        let limit = limit.to_string();
        let response = self
            .client
            .get(url)
            .bearer_auth(&token.raw)
            .query(&[
                ("direction", "asc"),
                ("limit", limit.as_str()),
                ("status", "active"),
            ])
            .send()
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(StoreError::Unavailable(format!("status code {}", response.status())));
        }

        let list: InvocationList = response
            .json()
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        Ok(list.invocations)
    }

    /// Replace the whole invocation document with its failed form.
    ///
    /// The request is authenticated as the invocation's pod, since only
    /// that identity may finalize it. The `if-match` precondition keeps
    /// the write from clobbering a concurrent update.
    pub async fn fail_timed_out(&self, invocation: &Invocation) -> Result<(), StoreError> {
        let update_failed = |detail: String| StoreError::UpdateFailed {
            ulid: invocation.ulid.clone(),
            detail,
        };

        let token = token::sign_pod_token(&self.token_key, &invocation.pod)
            .map_err(|error| update_failed(error.to_string()))?;

        let url = self
            .base_url
            .join(&format!("/api/v1/invocations/{}", invocation.ulid))
            .map_err(|error| update_failed(error.to_string()))?;

        let response = self
            .client
            .put(url)
            .bearer_auth(&token.raw)
            .header("if-match", &invocation.rev)
            .json(&failed_document(invocation))
            .send()
            .await
            .map_err(|error| update_failed(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(update_failed(format!("status code {}", response.status())));
        }

        Ok(())
    }
}

///
///
///
fn failed_document(invocation: &Invocation) -> Invocation {
    let mut document = invocation.clone();
    document.status = InvocationStatus::Failed;
    document.reason = Some(Value::String(String::from(REASON_TIMED_OUT)));
    document
}

#[derive(Deserialize)]
struct InvocationList {
    invocations: Vec<Invocation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvocationImage, InvocationPhase, PhaseStatus};
    use chrono::Utc;

    fn invocation() -> Invocation {
        Invocation {
            rev: String::from("2-def"),
            ulid: String::from("01h455vb4pex5vsknk084sn02q"),
            status: InvocationStatus::Running,
            result: None,
            reason: None,
            phases: vec![InvocationPhase {
                status: PhaseStatus::Running,
                date: Utc::now(),
                pod: String::from("fn-test-01h455"),
                reason: None,
            }],
            function_name: String::from("test"),
            image: InvocationImage {
                host: String::from("registry.local"),
                name: String::from("fn-test"),
                tag: String::from("latest"),
            },
            env: vec![],
            project: String::from("default"),
            runtime_test: None,
            resources: None,
            pod: String::from("fn-test-01h455"),
            retries: None,
            timeout: Some(60),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn failed_document_sets_status_and_reason() {
        let document = failed_document(&invocation());

        assert_eq!(document.status, InvocationStatus::Failed);
        assert_eq!(document.reason, Some(Value::String(String::from(REASON_TIMED_OUT))));
        // Everything else is carried over verbatim.
        assert_eq!(document.rev, "2-def");
        assert_eq!(document.phases.len(), 1);
        assert_eq!(document.timeout, Some(60));
    }
}
