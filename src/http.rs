use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::context::ExecutionContextStack;
use crate::coordinator::{ExecutionCoordinator, ExecutionOutcome};
use crate::error::ExecError;
use crate::groups::ExecutionGroup;
use crate::k8s::{self, KubeconfigSummary, KubectlGateway, ObjectStatus, WorkloadKind};
use crate::model::{Execution, ExecutionId, OutputSection, StreamEvent};
use crate::rollout::{
    DeploymentRefresh, DeploymentStatus, GroupedReply, RolloutAction, RolloutActionResult,
    RolloutRevision, RolloutStatus,
};
use crate::runner::{AllowList, CommandTransport, ProcessRunner};
use crate::stream::{self, StreamRunner};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub struct AppState {
    pub config: ServerConfig,
    pub runner: ProcessRunner,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub streams: StreamRunner,
    pub gateway: KubectlGateway,
}

impl AppState {
    pub fn from_config(config: ServerConfig) -> Self {
        let allow_list = AllowList::new(config.executable.clone());
        let runner = ProcessRunner::new(
            allow_list.clone(),
            Duration::from_millis(config.command_timeout_ms),
        )
        .with_scratch_dir(config.scratch_dir.clone());
        Self::with_transport(config, runner.clone(), Arc::new(runner))
    }

    pub fn with_transport(
        config: ServerConfig,
        runner: ProcessRunner,
        transport: Arc<dyn CommandTransport>,
    ) -> Self {
        let allow_list = AllowList::new(config.executable.clone());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            transport,
            allow_list.clone(),
            Arc::new(ExecutionContextStack::new()),
            config.update_channel_capacity,
        ));
        let streams = StreamRunner::new(allow_list, config.stream_channel_capacity);
        let gateway = KubectlGateway::new(Arc::clone(&coordinator))
            .with_rollout_settle(Duration::from_millis(config.rollout_settle_ms));
        Self {
            config,
            runner,
            coordinator,
            streams,
            gateway,
        }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    let api = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/execute/stream", post(start_stream))
        .route("/execute/stream/stop", post(stop_stream))
        .route("/execute/stream/{stream_id}/events", get(stream_events))
        .route("/execute/streams", get(active_streams))
        .route("/executions", get(executions))
        .route("/executions/cancelled", get(cancelled_executions))
        .route("/executions/events", get(execution_events))
        .route("/executions/history", delete(clear_history))
        .route("/executions/history/{id}", delete(remove_history_item))
        .route("/namespaces", get(namespaces))
        .route("/namespaces/{namespace}/resources", get(namespace_resources))
        .route(
            "/namespaces/{namespace}/deployments/{name}",
            get(deployment_status),
        )
        .route(
            "/namespaces/{namespace}/deployments/{name}/status",
            get(deployment_details),
        )
        .route(
            "/namespaces/{namespace}/deployments/{name}/rollout",
            get(rollout_status),
        )
        .route(
            "/namespaces/{namespace}/deployments/{name}/rollout/history",
            get(rollout_history),
        )
        .route(
            "/namespaces/{namespace}/deployments/{name}/rollout/{action}",
            post(rollout_action),
        )
        .route(
            "/namespaces/{namespace}/deployments/{name}/refresh",
            post(refresh_deployment),
        )
        .route("/namespaces/{namespace}/services/{name}", get(service_status))
        .route("/namespaces/{namespace}/pods/{name}", get(pod_status));

    info!(origins = ?state.config.allowed_origins, "api router created");
    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let origins = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(origin, "ignoring invalid CORS origin: {error}");
                None
            }
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(origins))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ExecError> for ApiError {
    fn from(error: ExecError) -> Self {
        let status = match &error {
            ExecError::Validation { .. }
            | ExecError::InvalidName(_)
            | ExecError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            ExecError::StreamConflict(_) => StatusCode::CONFLICT,
            ExecError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: Option<String>,
    #[serde(default)]
    group: Option<ExecutionGroup>,
    /// Typed by the user; runs under a fresh user-command group unless
    /// `group` is given.
    #[serde(default, rename = "userCommand")]
    user_command: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    success: bool,
    stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    command: String,
    execution_id: Option<ExecutionId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cancelled: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sections: Vec<OutputSection>,
}

async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = payload?;
    let command = request
        .command
        .filter(|command| !command.trim().is_empty())
        .ok_or_else(|| ExecError::Validation {
            executable: state.config.executable.clone(),
        })?;

    let group = match request.group {
        Some(group) => Some(group),
        None if request.user_command => Some(ExecutionGroup::user_command()),
        None => None,
    };
    let result = state.coordinator.execute(&command, group).await?;
    let response = ExecuteResponse {
        cancelled: result.is_cancelled(),
        command: result.command,
        execution_id: Some(result.execution_id),
        ..ExecuteResponse::default()
    };
    let response = match result.outcome {
        ExecutionOutcome::Completed(output) => ExecuteResponse {
            success: output.success,
            stdout: output.stdout,
            stderr: Some(output.stderr),
            error: output.error,
            timed_out: output.timed_out,
            exit_code: output.exit_code,
            sections: output.sections,
            ..response
        },
        ExecutionOutcome::Cancelled => response,
        ExecutionOutcome::Failed { error } => ExecuteResponse {
            error: Some(error),
            ..response
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamRequest {
    command: Option<String>,
    stream_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopStreamRequest {
    stream_id: Option<String>,
}

async fn start_stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartStreamRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let stream_id = request
        .stream_id
        .filter(|stream_id| !stream_id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("streamId is required"))?;
    let command = request.command.unwrap_or_default();

    state.streams.start(&command, &stream_id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Stream started",
        "streamId": stream_id,
    })))
}

async fn stop_stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StopStreamRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let stream_id = request
        .stream_id
        .ok_or_else(|| ApiError::bad_request("streamId is required"))?;

    state.streams.stop(&stream_id)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Stream {stream_id} stopped"),
    })))
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let streams = state.streams.clone();
    let grace = Duration::from_millis(state.config.stream_subscribe_grace_ms);
    let mut started = streams.is_active(&stream_id);
    if !started {
        debug!(stream_id = %stream_id, "subscribed ahead of stream start");
    }
    let mut rx = streams.subscribe(&stream_id);

    let events = async_stream::stream! {
        loop {
            let received = if started {
                rx.recv().await
            } else {
                match tokio::time::timeout(grace, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) if streams.is_active(&stream_id) => {
                        started = true;
                        continue;
                    }
                    Err(_) => {
                        debug!(stream_id = %stream_id, "no stream started for subscriber");
                        if let Some(sse) = stream_sse(&stream::not_found_event(&stream_id)) {
                            yield Ok::<Event, Infallible>(sse);
                        }
                        break;
                    }
                }
            };
            match received {
                Ok(event) => {
                    started = true;
                    let terminal = event.is_terminal();
                    if let Some(sse) = stream_sse(&event) {
                        yield Ok::<Event, Infallible>(sse);
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(stream_id = %stream_id, skipped, "stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

fn stream_sse(event: &StreamEvent) -> Option<Event> {
    match Event::default().event(event.event_name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(error) => {
            warn!(
                stream_id = event.stream_id(),
                "failed to encode stream event: {error}"
            );
            None
        }
    }
}

async fn active_streams(State(state): State<Arc<AppState>>) -> Json<Value> {
    let streams = state
        .streams
        .active_streams()
        .into_iter()
        .map(|stream| {
            json!({
                "streamId": stream.stream_id,
                "command": stream.command,
                "startedAt": stream.started_at,
            })
        })
        .collect::<Vec<_>>();
    Json(json!({ "streams": streams }))
}

#[derive(Debug, Serialize)]
struct ExecutionsResponse {
    pending: Vec<Execution>,
    history: Vec<Execution>,
}

async fn executions(State(state): State<Arc<AppState>>) -> Json<ExecutionsResponse> {
    Json(ExecutionsResponse {
        pending: state.coordinator.pending(),
        history: state.coordinator.history(),
    })
}

async fn cancelled_executions(State(state): State<Arc<AppState>>) -> Json<Vec<Execution>> {
    Json(state.coordinator.cancelled_history())
}

async fn execution_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.coordinator.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(execution) => match Event::default().event("execution-update").json_data(&execution) {
                    Ok(sse) => yield Ok::<Event, Infallible>(sse),
                    Err(error) => warn!("failed to encode execution update: {error}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "execution update subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn clear_history(State(state): State<Arc<AppState>>) -> StatusCode {
    state.coordinator.clear_history();
    StatusCode::NO_CONTENT
}

async fn remove_history_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    if state.coordinator.remove_history_item(ExecutionId(id)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("execution {} not found in history", ExecutionId(id)),
        })
    }
}

async fn namespaces(State(state): State<Arc<AppState>>) -> Json<k8s::ResourceList> {
    Json(state.gateway.get_namespaces().await)
}

async fn namespace_resources(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Result<Json<k8s::NamespaceResources>, ApiError> {
    Ok(Json(state.gateway.load_namespace_resources(&namespace).await?))
}

async fn deployment_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ObjectStatus>, ApiError> {
    object_status(&state, WorkloadKind::Deployment, &name, &namespace).await
}

async fn service_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ObjectStatus>, ApiError> {
    object_status(&state, WorkloadKind::Service, &name, &namespace).await
}

async fn pod_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ObjectStatus>, ApiError> {
    object_status(&state, WorkloadKind::Pod, &name, &namespace).await
}

async fn object_status(
    state: &AppState,
    kind: WorkloadKind,
    name: &str,
    namespace: &str,
) -> Result<Json<ObjectStatus>, ApiError> {
    Ok(Json(state.gateway.object_status(kind, name, namespace).await?))
}

async fn deployment_details(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<GroupedReply<DeploymentStatus>>, ApiError> {
    Ok(Json(state.gateway.deployment_status(&name, &namespace).await?))
}

async fn rollout_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<GroupedReply<RolloutStatus>>, ApiError> {
    Ok(Json(state.gateway.rollout_status(&name, &namespace).await?))
}

async fn rollout_history(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<GroupedReply<Vec<RolloutRevision>>>, ApiError> {
    Ok(Json(state.gateway.rollout_history(&name, &namespace).await?))
}

async fn rollout_action(
    State(state): State<Arc<AppState>>,
    Path((namespace, name, action)): Path<(String, String, RolloutAction)>,
) -> Result<Json<RolloutActionResult>, ApiError> {
    Ok(Json(
        state
            .gateway
            .rollout_action(action, &name, &namespace)
            .await?,
    ))
}

async fn refresh_deployment(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DeploymentRefresh>, ApiError> {
    Ok(Json(state.gateway.refresh_deployment(&name, &namespace).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kubectl: Option<KubectlInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_output: Option<String>,
    environment: EnvironmentInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    kubeconfig: Option<KubeconfigSummary>,
}

#[derive(Debug, Serialize)]
struct KubectlInfo {
    path: String,
    version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentInfo {
    #[serde(rename = "PATH")]
    path: Option<String>,
    #[serde(rename = "HOME")]
    home: Option<String>,
    #[serde(rename = "KUBECONFIG")]
    kubeconfig: Option<String>,
    working_directory: Option<String>,
}

impl EnvironmentInfo {
    fn capture() -> Self {
        Self {
            path: std::env::var("PATH").ok(),
            home: std::env::var("HOME").ok(),
            kubeconfig: std::env::var("KUBECONFIG").ok(),
            working_directory: std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string()),
        }
    }
}

/// Bypasses the coordinator so a health check never cancels in-flight work.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let executable = state.runner.allow_list().executable().to_string();
    let mut report = HealthReport {
        status: "kubectl not available",
        kubectl: None,
        error: None,
        raw_output: None,
        environment: EnvironmentInfo::capture(),
        kubeconfig: k8s::kubeconfig_summary(),
    };

    let path = match which::which(&executable) {
        Ok(path) => path.display().to_string(),
        Err(error) => {
            report.error = Some(format!("{executable}: {error}"));
            return Json(report);
        }
    };

    let output = match state
        .runner
        .run(&format!("{executable} version --client -o json"))
        .await
    {
        Ok(output) if output.success => output,
        Ok(output) => {
            report.error = output.error;
            return Json(report);
        }
        Err(error) => {
            report.error = Some(error.to_string());
            return Json(report);
        }
    };

    match serde_json::from_str::<Value>(&output.stdout) {
        Ok(version) => {
            report.status = "healthy";
            report.kubectl = Some(KubectlInfo {
                path,
                version: version
                    .pointer("/clientVersion/gitVersion")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        Err(_) => {
            report.status = "kubectl found but version parse failed";
            report.kubectl = Some(KubectlInfo {
                path,
                version: "unknown".to_string(),
            });
            report.raw_output = Some(output.stdout);
        }
    }
    Json(report)
}

#[cfg(test)]
mod tests {
    use super::{AppState, create_app};
    use crate::config::ServerConfig;
    use crate::error::ExecError;
    use crate::model::CommandOutput;
    use crate::runner::{AllowList, CommandTransport, ProcessRunner};
    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct EchoTransport;

    #[async_trait]
    impl CommandTransport for EchoTransport {
        async fn run(
            &self,
            command: &str,
            _cancel: CancellationToken,
        ) -> Result<CommandOutput, ExecError> {
            Ok(CommandOutput {
                success: true,
                stdout: format!("ran: {command}"),
                exit_code: Some(0),
                ..CommandOutput::default()
            })
        }
    }

    fn app_with_config(config: ServerConfig) -> Router {
        let runner = ProcessRunner::new(
            AllowList::new(config.executable.clone()),
            Duration::from_secs(5),
        );
        let state = AppState::with_transport(config, runner, Arc::new(EchoTransport));
        create_app(Arc::new(state))
    }

    fn app_with_executable(executable: &str) -> Router {
        app_with_config(ServerConfig {
            executable: executable.to_string(),
            ..ServerConfig::default()
        })
    }

    fn app() -> Router {
        app_with_executable("kubectl")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn execute_runs_allowed_command() {
        let response = app()
            .oneshot(post_json("/api/execute", json!({"command": "kubectl get pods"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["stdout"], json!("ran: kubectl get pods"));
        assert_eq!(body["command"], json!("kubectl get pods"));
        assert!(body["executionId"].is_u64());
        assert!(body.get("cancelled").is_none());
    }

    #[tokio::test]
    async fn execute_rejects_other_executables() {
        let response = app()
            .oneshot(post_json("/api/execute", json!({"command": "rm -rf /"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Only kubectl commands are allowed"));
    }

    #[tokio::test]
    async fn execute_requires_a_command() {
        let response = app()
            .oneshot(post_json("/api/execute", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_can_be_listed_and_trimmed() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/execute",
                json!({"command": "kubectl get ns", "group": "user-command-1"}),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["executionId"].as_u64().unwrap();

        let listed = body_json(
            app.clone()
                .oneshot(request("GET", "/api/executions"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed["pending"], json!([]));
        assert_eq!(listed["history"][0]["status"], json!("completed"));
        assert_eq!(listed["history"][0]["group"], json!("user-command-1"));

        let removed = app
            .clone()
            .oneshot(request("DELETE", &format!("/api/executions/history/{id}")))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::NO_CONTENT);

        let missing = app
            .oneshot(request("DELETE", &format!("/api/executions/history/{id}")))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stopping_unknown_stream_is_not_found() {
        let response = app()
            .oneshot(post_json("/api/execute/stream/stop", json!({"streamId": "s1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["success"], json!(false));
    }

    #[tokio::test]
    async fn duplicate_stream_is_a_conflict() {
        let app = app_with_executable("sleep");
        let start = json!({"command": "sleep 5", "streamId": "dup"});

        let first = app
            .clone()
            .oneshot(post_json("/api/execute/stream", start.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_json(first).await["streamId"], json!("dup"));

        let second = app
            .clone()
            .oneshot(post_json("/api/execute/stream", start))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let stopped = app
            .oneshot(post_json("/api/execute/stream/stop", json!({"streamId": "dup"})))
            .await
            .unwrap();
        assert_eq!(stopped.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_events_are_delivered_as_sse() {
        let app = app_with_executable("sh");

        let events = app
            .clone()
            .oneshot(request("GET", "/api/execute/stream/s1/events"))
            .await
            .unwrap();
        assert_eq!(events.status(), StatusCode::OK);

        let started = app
            .oneshot(post_json(
                "/api/execute/stream",
                json!({"command": "sh -c 'printf hello'", "streamId": "s1"}),
            ))
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::OK);

        let bytes = tokio::time::timeout(Duration::from_secs(10), events.into_body().collect())
            .await
            .unwrap()
            .unwrap()
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: stream-data"));
        assert!(text.contains("\"data\":\"hello\""));
        assert!(text.contains("event: stream-end"));
        assert!(text.contains("\"fullOutput\":\"hello\""));
    }

    #[tokio::test]
    async fn user_commands_get_their_own_group() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/execute",
                json!({"command": "kubectl get pods", "userCommand": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let listed = body_json(
            app.oneshot(request("GET", "/api/executions"))
                .await
                .unwrap(),
        )
        .await;
        let group = listed["history"][0]["group"].as_str().unwrap();
        assert!(group.starts_with("user-command-"));
    }

    #[tokio::test]
    async fn object_status_is_served_per_kind() {
        let response = app()
            .oneshot(request("GET", "/api/namespaces/prod/deployments/api"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["kind"], json!("deployment"));
        assert_eq!(
            body["output"],
            json!("ran: kubectl get deployment api -n prod -o wide")
        );
        assert!(
            body["group"]
                .as_str()
                .unwrap()
                .starts_with("deployment-ops-")
        );
    }

    #[tokio::test]
    async fn invalid_namespace_is_rejected() {
        let response = app()
            .oneshot(request("GET", "/api/namespaces/Not_Valid/resources"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_keeps_the_error_shape() {
        let broken = Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header("content-type", "application/json")
            .body(Body::from("{\"command\": "))
            .unwrap();
        let response = app().oneshot(broken).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].is_string());

        let untyped = Request::builder()
            .method("POST")
            .uri("/api/execute/stream")
            .body(Body::from("{}"))
            .unwrap();
        let response = app().oneshot(untyped).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(response).await["success"], json!(false));
    }

    #[tokio::test]
    async fn unbalanced_stream_command_is_a_bad_request() {
        let response = app_with_executable("sh")
            .oneshot(post_json(
                "/api/execute/stream",
                json!({"command": "sh -c 'echo", "streamId": "q"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscription_to_unknown_stream_ends_with_error() {
        let app = app_with_config(ServerConfig {
            executable: "sh".to_string(),
            stream_subscribe_grace_ms: 50,
            ..ServerConfig::default()
        });

        let events = app
            .oneshot(request("GET", "/api/execute/stream/nobody/events"))
            .await
            .unwrap();
        let bytes = tokio::time::timeout(Duration::from_secs(5), events.into_body().collect())
            .await
            .unwrap()
            .unwrap()
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.contains("event: stream-error"));
        assert!(text.contains("stream 'nobody' not found"));
        assert!(!text.contains("event: stream-data"));
    }

    #[tokio::test]
    async fn rollout_action_returns_result_and_refresh() {
        let app = app_with_config(ServerConfig {
            rollout_settle_ms: 0,
            ..ServerConfig::default()
        });

        let response = app
            .oneshot(request(
                "POST",
                "/api/namespaces/prod/deployments/web/rollout/pause",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["action"], json!("pause"));
        assert_eq!(body["success"], json!(true));
        assert_eq!(
            body["output"],
            json!("ran: kubectl rollout pause deployment/web -n prod")
        );
        assert_eq!(body["group"], json!("deployment-ops-web-prod"));
        assert!(
            body["refresh"]["group"]
                .as_str()
                .unwrap()
                .starts_with("refresh-status-web-prod-")
        );
        assert_eq!(body["refresh"]["history"]["data"], json!([]));
    }

    #[tokio::test]
    async fn health_always_answers() {
        let response = app_with_executable("kubecmds-missing-binary")
            .oneshot(request("GET", "/api/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("kubectl not available"));
        assert!(body["environment"].get("workingDirectory").is_some());
    }
}
