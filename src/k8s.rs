use kube::config::Kubeconfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{ExecutionCoordinator, ExecutionOutcome, ExecutionResult};
use crate::error::ExecError;
use crate::groups::ExecutionGroup;

const NAME_JSONPATH: &str = "-o jsonpath=\"{.items[*].metadata.name}\"";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    pub items: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceList {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub group: ExecutionGroup,
    pub output: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    Service,
    Pod,
}

impl WorkloadKind {
    fn resource(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Pod => "pod",
        }
    }

    fn group(self, name: &str, namespace: &str) -> ExecutionGroup {
        match self {
            Self::Deployment => ExecutionGroup::deployment_operations(name, namespace),
            Self::Service => ExecutionGroup::service_status_query(name, namespace),
            Self::Pod => ExecutionGroup::pod_operations(name, namespace),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceResources {
    pub namespace: String,
    pub group: ExecutionGroup,
    pub deployments: ResourceList,
    pub pods: ResourceList,
    pub services: ResourceList,
}

#[derive(Clone)]
pub struct KubectlGateway {
    coordinator: Arc<ExecutionCoordinator>,
    rollout_settle: Duration,
}

impl KubectlGateway {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            coordinator,
            rollout_settle: Duration::from_secs(1),
        }
    }

    pub fn with_rollout_settle(mut self, rollout_settle: Duration) -> Self {
        self.rollout_settle = rollout_settle;
        self
    }

    pub fn rollout_settle(&self) -> Duration {
        self.rollout_settle
    }

    pub async fn get_namespaces(&self) -> ResourceList {
        self.list("namespaces", None).await
    }

    pub async fn get_deployments(&self, namespace: &str) -> ResourceList {
        self.list("deployments", Some(namespace)).await
    }

    pub async fn get_pods(&self, namespace: &str) -> ResourceList {
        self.list("pods", Some(namespace)).await
    }

    pub async fn get_services(&self, namespace: &str) -> ResourceList {
        self.list("services", Some(namespace)).await
    }

    /// Loads deployments, pods and services concurrently as one cooperating
    /// group so the three listings never cancel each other.
    pub async fn load_namespace_resources(
        &self,
        namespace: &str,
    ) -> Result<NamespaceResources, ExecError> {
        validate_resource_name(namespace)?;
        let group = ExecutionGroup::namespace_resource_loading(namespace);
        let gateway = self;
        let (deployments, pods, services) = self
            .coordinator
            .contexts()
            .with_group(group.clone(), move || async move {
                tokio::join!(
                    gateway.get_deployments(namespace),
                    gateway.get_pods(namespace),
                    gateway.get_services(namespace),
                )
            })
            .await;

        Ok(NamespaceResources {
            namespace: namespace.to_string(),
            group,
            deployments,
            pods,
            services,
        })
    }

    /// Queries one deployment, service or pod under that object's own group.
    pub async fn object_status(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
    ) -> Result<ObjectStatus, ExecError> {
        validate_resource_name(name)?;
        validate_resource_name(namespace)?;
        let group = kind.group(name, namespace);
        let command = format!(
            "{} get {} {name} -n {namespace} -o wide",
            self.coordinator.allow_list().executable(),
            kind.resource()
        );

        let result = self.execute_in(&group, &command).await?;

        let mut status = ObjectStatus {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
            group,
            output: String::new(),
            cancelled: result.is_cancelled(),
            error: None,
        };
        match result.outcome {
            ExecutionOutcome::Completed(output) => {
                status.output = output.stdout;
                status.error = output.error;
            }
            ExecutionOutcome::Failed { error } => status.error = Some(error),
            ExecutionOutcome::Cancelled => {}
        }
        Ok(status)
    }

    /// Runs `command` under `group`. An active scope for `group` is reused
    /// even when other scopes were entered after it.
    pub async fn execute_in(
        &self,
        group: &ExecutionGroup,
        command: &str,
    ) -> Result<ExecutionResult, ExecError> {
        let contexts = self.coordinator.contexts();
        if contexts.is_in_group(group) {
            return self.coordinator.execute(command, Some(group.clone())).await;
        }
        let coordinator = &self.coordinator;
        contexts
            .with_group(group.clone(), move || async move {
                coordinator.execute(command, None).await
            })
            .await
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    async fn list(&self, resource: &str, namespace: Option<&str>) -> ResourceList {
        if let Some(namespace) = namespace
            && let Err(error) = validate_resource_name(namespace)
        {
            return ResourceList::failed(error.to_string());
        }

        let executable = self.coordinator.allow_list().executable();
        let command = match namespace {
            Some(namespace) => format!("{executable} get {resource} -n {namespace} {NAME_JSONPATH}"),
            None => format!("{executable} get {resource} {NAME_JSONPATH}"),
        };

        match self.coordinator.execute(&command, None).await {
            Err(error) => ResourceList::failed(error.to_string()),
            Ok(result) => match result.outcome {
                ExecutionOutcome::Completed(output) if output.success => ResourceList {
                    items: output
                        .stdout
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    ..ResourceList::default()
                },
                ExecutionOutcome::Completed(output) => ResourceList::failed(
                    output
                        .error
                        .unwrap_or_else(|| format!("failed to list {resource}")),
                ),
                ExecutionOutcome::Cancelled => ResourceList {
                    cancelled: true,
                    ..ResourceList::default()
                },
                ExecutionOutcome::Failed { error } => ResourceList::failed(error),
            },
        }
    }
}

/// Kubernetes object names are DNS-1123 labels; anything else would be
/// interpolated into a shell command line.
pub fn validate_resource_name(name: &str) -> Result<(), ExecError> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(ExecError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSummary {
    pub current_context: Option<String>,
    pub contexts: Vec<ContextCatalogRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCatalogRow {
    pub context: String,
    pub cluster: String,
    pub server: Option<String>,
    pub user: Option<String>,
    pub namespace: Option<String>,
}

pub fn kubeconfig_summary() -> Option<KubeconfigSummary> {
    Kubeconfig::read().ok().map(|kubeconfig| summarize_kubeconfig(&kubeconfig))
}

fn summarize_kubeconfig(kubeconfig: &Kubeconfig) -> KubeconfigSummary {
    let mut cluster_servers = HashMap::new();
    for cluster in &kubeconfig.clusters {
        let server = cluster
            .cluster
            .as_ref()
            .and_then(|entry| entry.server.clone());
        cluster_servers.insert(cluster.name.clone(), server);
    }

    let mut contexts = kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let context = named.context.as_ref()?;
            Some(ContextCatalogRow {
                context: named.name.clone(),
                cluster: context.cluster.clone(),
                server: cluster_servers
                    .get(&context.cluster)
                    .cloned()
                    .unwrap_or(None),
                user: context.user.clone(),
                namespace: context.namespace.clone(),
            })
        })
        .collect::<Vec<_>>();
    contexts.sort_by(|left, right| {
        left.context
            .cmp(&right.context)
            .then_with(|| left.cluster.cmp(&right.cluster))
    });

    KubeconfigSummary {
        current_context: kubeconfig.current_context.clone(),
        contexts,
    }
}
