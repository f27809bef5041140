use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::coordinator::{ExecutionOutcome, ExecutionResult};
use crate::error::ExecError;
use crate::groups::ExecutionGroup;
use crate::k8s::{KubectlGateway, validate_resource_name};
use crate::model::CommandOutput;

const REVISION_ANNOTATION: &str = "/metadata/annotations/deployment.kubernetes.io~1revision";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutAction {
    Pause,
    Resume,
    Restart,
    Undo,
}

impl RolloutAction {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Restart => "restart",
            Self::Undo => "undo",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaCounts {
    pub ready: u64,
    pub desired: u64,
    pub updated: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    Progressing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub name: String,
    pub namespace: String,
    pub replicas: ReplicaCounts,
    pub status: DeploymentPhase,
    pub revision: Option<u64>,
    pub conditions: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutPhase {
    InProgress,
    Complete,
    Failed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub deployment: String,
    pub namespace: String,
    pub revision: Option<u64>,
    pub status: RolloutPhase,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutRevision {
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedReply<T> {
    pub group: ExecutionGroup,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> GroupedReply<T> {
    fn new(group: &ExecutionGroup) -> Self {
        Self {
            group: group.clone(),
            data: None,
            cancelled: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRefresh {
    pub group: ExecutionGroup,
    pub status: GroupedReply<DeploymentStatus>,
    pub history: GroupedReply<Vec<RolloutRevision>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutActionResult {
    pub action: RolloutAction,
    pub deployment: String,
    pub namespace: String,
    pub group: ExecutionGroup,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<DeploymentRefresh>,
}

impl KubectlGateway {
    /// Runs `kubectl rollout <action>` under the deployment's group. A
    /// successful action is followed, after the settle delay, by a grouped
    /// status and history refresh.
    pub async fn rollout_action(
        &self,
        action: RolloutAction,
        deployment: &str,
        namespace: &str,
    ) -> Result<RolloutActionResult, ExecError> {
        validate_resource_name(deployment)?;
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::deployment_operations(deployment, namespace);
        let command = format!(
            "{} rollout {} deployment/{deployment} -n {namespace}",
            self.executable(),
            action.verb()
        );
        let result = self.execute_in(&group, &command).await?;

        let mut reply = RolloutActionResult {
            action,
            deployment: deployment.to_string(),
            namespace: namespace.to_string(),
            group,
            success: false,
            output: String::new(),
            cancelled: result.is_cancelled(),
            error: None,
            refresh: None,
        };
        match result.outcome {
            ExecutionOutcome::Completed(output) => {
                reply.success = output.success;
                reply.output = output.stdout;
                reply.error = output.error;
            }
            ExecutionOutcome::Failed { error } => reply.error = Some(error),
            ExecutionOutcome::Cancelled => {}
        }
        info!(
            deployment,
            namespace,
            action = action.verb(),
            success = reply.success,
            "rollout action finished"
        );

        if reply.success {
            tokio::time::sleep(self.rollout_settle()).await;
            reply.refresh = Some(self.refresh_deployment(deployment, namespace).await?);
        }
        Ok(reply)
    }

    pub async fn refresh_deployment(
        &self,
        deployment: &str,
        namespace: &str,
    ) -> Result<DeploymentRefresh, ExecError> {
        validate_resource_name(deployment)?;
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::refresh_status(deployment, namespace);
        let gateway = self;
        let group_ref = &group;
        let (status, history) = self
            .coordinator()
            .contexts()
            .with_group(group.clone(), move || async move {
                tokio::join!(
                    gateway.fetch_deployment_status(group_ref, deployment, namespace),
                    gateway.fetch_rollout_history(group_ref, deployment, namespace),
                )
            })
            .await;

        Ok(DeploymentRefresh {
            group,
            status: status?,
            history: history?,
        })
    }

    pub async fn deployment_status(
        &self,
        deployment: &str,
        namespace: &str,
    ) -> Result<GroupedReply<DeploymentStatus>, ExecError> {
        validate_resource_name(deployment)?;
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::deployment_operations(deployment, namespace);
        self.fetch_deployment_status(&group, deployment, namespace)
            .await
    }

    pub async fn rollout_history(
        &self,
        deployment: &str,
        namespace: &str,
    ) -> Result<GroupedReply<Vec<RolloutRevision>>, ExecError> {
        validate_resource_name(deployment)?;
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::deployment_operations(deployment, namespace);
        self.fetch_rollout_history(&group, deployment, namespace)
            .await
    }

    /// `kubectl rollout status` with a short timeout combined with the
    /// deployment's replica counts.
    pub async fn rollout_status(
        &self,
        deployment: &str,
        namespace: &str,
    ) -> Result<GroupedReply<RolloutStatus>, ExecError> {
        validate_resource_name(deployment)?;
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::deployment_operations(deployment, namespace);
        let command = format!(
            "{} rollout status deployment/{deployment} -n {namespace} --timeout=1s",
            self.executable()
        );
        let rollout = self.execute_in(&group, &command).await?;
        let details = self
            .fetch_deployment_status(&group, deployment, namespace)
            .await?;

        let mut reply = GroupedReply::new(&group);
        let rollout = match completed(rollout) {
            Ok(output) => output,
            Err(interrupted) => {
                reply.cancelled = interrupted.cancelled;
                reply.error = interrupted.error;
                return Ok(reply);
            }
        };
        let Some(details) = details.data else {
            reply.cancelled = details.cancelled;
            reply.error = details.error;
            return Ok(reply);
        };
        reply.data = Some(summarize_rollout(deployment, namespace, &rollout, &details));
        Ok(reply)
    }

    async fn fetch_deployment_status(
        &self,
        group: &ExecutionGroup,
        deployment: &str,
        namespace: &str,
    ) -> Result<GroupedReply<DeploymentStatus>, ExecError> {
        let command = format!(
            "{} get deployment {deployment} -n {namespace} -o json",
            self.executable()
        );
        let result = self.execute_in(group, &command).await?;
        Ok(into_reply(group, result, |stdout| parse_deployment_status(stdout)))
    }

    async fn fetch_rollout_history(
        &self,
        group: &ExecutionGroup,
        deployment: &str,
        namespace: &str,
    ) -> Result<GroupedReply<Vec<RolloutRevision>>, ExecError> {
        let command = format!(
            "{} rollout history deployment/{deployment} -n {namespace}",
            self.executable()
        );
        let result = self.execute_in(group, &command).await?;
        Ok(into_reply(group, result, |stdout| Ok(parse_rollout_history(stdout))))
    }

    fn executable(&self) -> &str {
        self.coordinator().allow_list().executable()
    }
}

struct Interrupted {
    cancelled: bool,
    error: Option<String>,
}

/// Every completed output, successful or not, is returned; kubectl reports
/// an unfinished rollout through a non-zero exit.
fn completed(result: ExecutionResult) -> Result<CommandOutput, Interrupted> {
    match result.outcome {
        ExecutionOutcome::Completed(output) => Ok(output),
        ExecutionOutcome::Cancelled => Err(Interrupted {
            cancelled: true,
            error: None,
        }),
        ExecutionOutcome::Failed { error } => Err(Interrupted {
            cancelled: false,
            error: Some(error),
        }),
    }
}

fn into_reply<T>(
    group: &ExecutionGroup,
    result: ExecutionResult,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> GroupedReply<T> {
    let mut reply = GroupedReply::new(group);
    match completed(result) {
        Ok(output) if output.success => match parse(&output.stdout) {
            Ok(data) => reply.data = Some(data),
            Err(error) => reply.error = Some(error),
        },
        Ok(output) => {
            reply.error = Some(output.error.unwrap_or(output.stderr));
        }
        Err(interrupted) => {
            reply.cancelled = interrupted.cancelled;
            reply.error = interrupted.error;
        }
    }
    reply
}

fn parse_deployment_status(stdout: &str) -> Result<DeploymentStatus, String> {
    let data: Value = serde_json::from_str(stdout)
        .map_err(|error| format!("invalid deployment JSON: {error}"))?;
    let text = |pointer: &str| {
        data.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let count = |pointer: &str| data.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
    let conditions = data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(DeploymentStatus {
        name: text("/metadata/name"),
        namespace: text("/metadata/namespace"),
        replicas: ReplicaCounts {
            ready: count("/status/readyReplicas"),
            desired: count("/spec/replicas"),
            updated: count("/status/updatedReplicas"),
            available: count("/status/availableReplicas"),
        },
        status: deployment_phase(&conditions),
        revision: data
            .pointer(REVISION_ANNOTATION)
            .and_then(Value::as_str)
            .and_then(|revision| revision.parse().ok()),
        conditions,
    })
}

/// Decided by the first `Progressing` condition.
fn deployment_phase(conditions: &[Value]) -> DeploymentPhase {
    let progressing = conditions
        .iter()
        .find(|condition| condition.get("type").and_then(Value::as_str) == Some("Progressing"));
    let Some(condition) = progressing else {
        return DeploymentPhase::Progressing;
    };
    let status = condition.get("status").and_then(Value::as_str);
    let reason = condition.get("reason").and_then(Value::as_str);
    match (status, reason) {
        (Some("True"), Some("NewReplicaSetAvailable")) => DeploymentPhase::Complete,
        (Some("False"), _) => DeploymentPhase::Failed,
        _ => DeploymentPhase::Progressing,
    }
}

fn summarize_rollout(
    deployment: &str,
    namespace: &str,
    rollout: &CommandOutput,
    details: &DeploymentStatus,
) -> RolloutStatus {
    let message = if rollout.stdout.trim().is_empty() {
        rollout.stderr.trim()
    } else {
        rollout.stdout.trim()
    };
    let ReplicaCounts { ready, desired, .. } = details.replicas;
    let mut progress = if desired > 0 {
        u8::try_from((ready.min(desired) * 100 + desired / 2) / desired).unwrap_or(100)
    } else {
        0
    };

    let status = if rollout.success && message.contains("successfully rolled out") {
        progress = 100;
        RolloutPhase::Complete
    } else if details.status == DeploymentPhase::Failed {
        RolloutPhase::Failed
    } else if message.contains("paused") {
        RolloutPhase::Paused
    } else {
        RolloutPhase::InProgress
    };
    debug!(deployment, namespace, ?status, progress, "rollout status");

    RolloutStatus {
        deployment: deployment.to_string(),
        namespace: namespace.to_string(),
        revision: details.revision,
        status,
        progress,
        message: message.to_string(),
    }
}

/// Newest revision first. Lines that do not start with a revision number,
/// such as the resource name and the column header, are skipped.
fn parse_rollout_history(stdout: &str) -> Vec<RolloutRevision> {
    let mut revisions = stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (revision, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let revision = revision.parse().ok()?;
            let cause = rest.trim();
            Some(RolloutRevision {
                revision,
                change_cause: (!cause.is_empty() && cause != "<none>").then(|| cause.to_string()),
            })
        })
        .collect::<Vec<_>>();
    revisions.reverse();
    revisions
}
