use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Invocation document as stored by the runlet API.
///
/// The invoker treats invocations as read-mostly data: the only write it
/// ever performs is the timeout failure, which re-serializes this whole
/// document with `status` and `reason` replaced.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Version token, matched with `if-match` on updates.
    #[serde(rename = "_rev")]
    pub rev: String,
    /// Lowercased ULID.
    pub ulid: String,
    pub status: InvocationStatus,
    /// Completion result value, present once `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason, present once `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    /// History of status transitions, oldest first.
    pub phases: Vec<InvocationPhase>,
    /// Source function's name.
    pub function_name: String,
    pub image: InvocationImage,
    pub env: Vec<InvocationEnv>,
    /// Authorization group name.
    pub project: String,
    /// Test runs are flagged here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_test: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<InvocationResources>,
    /// Name of the invocation's pod, assigned once by the API.
    pub pod: String,
    /// Remaining retries after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Timeout in seconds since reaching the `running` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invocation {
    ///
    ///
    ///
    pub fn last_phase(&self) -> Option<&InvocationPhase> {
        self.phases.last()
    }
}

/// Possible invocation statuses.
///
/// - `pending`: queued to be started.
/// - `initializing`: the pod exists, waiting for its acknowledgement.
/// - `running`: the pod has started to process its task.
/// - `completed`: the task finished successfully.
/// - `failed`: the task failed.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Initializing => "initializing",
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        };

        write!(f, "{}", status)
    }
}

/// A recorded status transition. Running pods additionally report
/// `progress` phases; the invoker never branches on those, but must
/// round-trip them when re-serializing the document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Initializing,
    Running,
    Progress,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InvocationPhase {
    pub status: PhaseStatus,
    pub date: DateTime<Utc>,
    /// Pod active at the time of the transition.
    pub pod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InvocationImage {
    /// Registry host, without protocol or path.
    pub host: String,
    pub name: String,
    pub tag: String,
}

impl InvocationImage {
    ///
    ///
    ///
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.host, self.name, self.tag)
    }
}

/// Environment entry: either a literal value or a reference to a
/// secret by name and key, never both.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEnv {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InvocationResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}
