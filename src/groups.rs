use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Category of an execution group. Lower priority numbers pre-empt higher ones.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum GroupKind {
    UserCommand,
    DeploymentOps,
    NamespaceLoad,
    ServiceStatus,
    Unknown,
}

impl GroupKind {
    const RANKED: [Self; 4] = [
        Self::UserCommand,
        Self::DeploymentOps,
        Self::NamespaceLoad,
        Self::ServiceStatus,
    ];

    pub fn priority(self) -> u32 {
        match self {
            Self::UserCommand => 1,
            Self::DeploymentOps => 2,
            Self::NamespaceLoad => 3,
            Self::ServiceStatus => 4,
            Self::Unknown => 999,
        }
    }

    pub fn prefix(self) -> Option<&'static str> {
        match self {
            Self::UserCommand => Some("user-command"),
            Self::DeploymentOps => Some("deployment-ops"),
            Self::NamespaceLoad => Some("namespace-resource-loading"),
            Self::ServiceStatus => Some("service-status"),
            Self::Unknown => None,
        }
    }

    pub fn classify(label: &str) -> Self {
        Self::RANKED
            .into_iter()
            .filter_map(|kind| kind.prefix().map(|prefix| (kind, prefix)))
            .filter(|(_, prefix)| label.starts_with(prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .map(|(kind, _)| kind)
            .unwrap_or(Self::Unknown)
    }
}

const POD_OPERATIONS_PREFIX: &str = "pod-ops";

/// Caller-assigned label correlating related executions.
///
/// Identity is the full label: two executions belong to the same group only
/// when their labels are equal. The category (and therefore the priority) is
/// derived from the label prefix.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionGroup(String);

impl ExecutionGroup {
    pub fn from_label(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn user_command() -> Self {
        Self(format!("user-command-{}", scope_token()))
    }

    pub fn namespace_resource_loading(namespace: &str) -> Self {
        Self(format!(
            "namespace-resource-loading-{namespace}-{}",
            scope_token()
        ))
    }

    /// Stable across calls so every operation on one deployment cooperates.
    pub fn deployment_operations(deployment: &str, namespace: &str) -> Self {
        Self(format!("deployment-ops-{deployment}-{namespace}"))
    }

    pub fn service_status_query(service: &str, namespace: &str) -> Self {
        Self(format!(
            "service-status-{service}-{namespace}-{}",
            scope_token()
        ))
    }

    /// Pod operations are not ranked and fall back to the lowest priority.
    pub fn pod_operations(pod: &str, namespace: &str) -> Self {
        Self(format!(
            "{POD_OPERATIONS_PREFIX}-{pod}-{namespace}-{}",
            scope_token()
        ))
    }

    pub fn refresh_status(deployment: &str, namespace: &str) -> Self {
        Self(format!(
            "refresh-status-{deployment}-{namespace}-{}",
            scope_token()
        ))
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> GroupKind {
        GroupKind::classify(&self.0)
    }

    pub fn priority(&self) -> u32 {
        self.kind().priority()
    }
}

impl Display for ExecutionGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn priority_of(group: Option<&ExecutionGroup>) -> u32 {
    group
        .map(ExecutionGroup::priority)
        .unwrap_or_else(|| GroupKind::Unknown.priority())
}

/// Whether an execution in `candidate` may cancel one in `incumbent`.
/// Equal priority resolves in favor of the candidate (the newer execution).
pub fn should_cancel(candidate: Option<&ExecutionGroup>, incumbent: Option<&ExecutionGroup>) -> bool {
    priority_of(candidate) <= priority_of(incumbent)
}

fn scope_token() -> String {
    let token = Uuid::new_v4().simple().to_string();
    token[..12].to_string()
}
