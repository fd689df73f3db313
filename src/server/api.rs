use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use dockyard_common::{DockyardError, ErrorKind, LimitsUpdate};
use serde::Deserialize;
use tracing::error;

use crate::orchestrator::{CreateContainerRequest, Orchestrator};

/// Default and maximum number of samples `GET .../metrics` returns.
const DEFAULT_METRICS_LIMIT: usize = 100;
const MAX_METRICS_LIMIT: usize = 1000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> SharedState {
        Arc::new(Self { orchestrator })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBody {
    #[serde(flatten)]
    pub request: CreateContainerRequest,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Deserialize)]
pub struct LimitsBody {
    #[serde(flatten)]
    pub update: LimitsUpdate,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    pub include_metrics: bool,
}

#[derive(Deserialize, Default)]
pub struct CreateQuery {
    /// Block until provisioning finishes instead of answering with the task.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
    pub task_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct TaskQuery {
    pub task_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct MetricsQuery {
    pub limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Runtime => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DockyardError> for ApiError {
    fn from(err: DockyardError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Internal {
            error!(error = ?err, "request failed");
        }
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind.as_str(),
        });
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/containers",
            get(list_containers).post(create_container),
        )
        .route(
            "/api/containers/{id}",
            get(get_container).delete(delete_container),
        )
        .route("/api/containers/{id}/start", post(start_container))
        .route("/api/containers/{id}/stop", post(stop_container))
        .route("/api/containers/{id}/restart", post(restart_container))
        .route("/api/containers/{id}/limits", patch(update_limits))
        .route("/api/containers/{id}/metrics", get(container_metrics))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/reconcile", post(reconcile))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_containers(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.orchestrator.get_all(query.include_metrics).await?;
    Ok(Json(items))
}

async fn create_container(
    State(state): State<SharedState>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<CreateBody>,
) -> Result<Response, ApiError> {
    if query.wait {
        let record = state.orchestrator.create(body.request, body.task_id).await?;
        return Ok((StatusCode::CREATED, Json(record)).into_response());
    }
    let outcome = state
        .orchestrator
        .create_async(body.request, body.task_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

async fn get_container(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.get_by_id(&id).await?;
    let item = state.orchestrator.enrich(record, true).await?;
    Ok(Json(item))
}

async fn delete_container(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .orchestrator
        .delete_with_task(&id, query.task_id, query.force)
        .await?;
    Ok(Json(outcome))
}

async fn start_container(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.start_with_task(&id, query.task_id).await?;
    Ok(Json(record))
}

async fn stop_container(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.stop_with_task(&id, query.task_id).await?;
    Ok(Json(record))
}

async fn restart_container(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .orchestrator
        .restart_with_task(&id, query.task_id)
        .await?;
    Ok(Json(record))
}

async fn update_limits(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<LimitsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state
        .orchestrator
        .update_limits_with_task(&id, body.update, body.task_id)
        .await?;
    Ok(Json(item))
}

async fn container_metrics(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_METRICS_LIMIT)
        .clamp(1, MAX_METRICS_LIMIT);
    let history = state.orchestrator.metrics_history(&id, limit).await?;
    Ok(Json(history))
}

async fn list_tasks(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.tasks().get_all())
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.tasks().get(&id) {
        Some(task) => Ok(Json(task)),
        None => Err(DockyardError::TaskNotFound { id }.into()),
    }
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.tasks().delete(&id) {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(DockyardError::TaskNotFound { id }.into()),
    }
}

async fn reconcile(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.orchestrator.reconcile().await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::{Harness, harness};
    use axum::body::Body;
    use axum::http::Request;
    use dockyard_common::ContainerStatus;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(h: &Harness) -> Router {
        api_router().with_state(AppState::new(h.orchestrator.clone()))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn create_waiting(app: &Router, name: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/containers?wait=true",
                serde_json::json!({ "name": name }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response.into_body()).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness();
        let response = test_app(&h)
            .oneshot(empty_request("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_containers_empty() {
        let h = harness();
        let response = test_app(&h)
            .oneshot(empty_request("GET", "/api/containers?include_metrics=true"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let items: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_create_and_wait() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "web").await;
        assert_eq!(record["name"], "web");
        assert_eq!(record["status"], "stopped");

        let id = record["id"].as_str().unwrap();
        let response = app
            .oneshot(empty_request("GET", &format!("/api/containers/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let item: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(item["id"], id);
    }

    #[tokio::test]
    async fn test_create_async_returns_task() {
        let h = harness();
        let app = test_app(&h);
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/containers",
                serde_json::json!({ "name": "demo", "task_id": "t-demo" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let outcome: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(outcome["task"]["id"], "t-demo");
        assert_eq!(outcome["container"]["status"], "creating");

        let container_id = outcome["container"]["id"].as_str().unwrap().to_string();
        for _ in 0..100 {
            if h.orchestrator
                .get_by_id(&container_id)
                .await
                .map(|r| r.status == ContainerStatus::Stopped)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app
            .oneshot(empty_request("GET", "/api/tasks/t-demo"))
            .await
            .unwrap();
        let task: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["progress"], 100);
    }

    #[tokio::test]
    async fn test_invalid_name_is_bad_request() {
        let h = harness();
        let response = test_app(&h)
            .oneshot(json_request(
                "POST",
                "/api/containers?wait=true",
                serde_json::json!({ "name": "../etc" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "validation");
        assert!(body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let h = harness();
        let app = test_app(&h);
        create_waiting(&app, "twice").await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/containers?wait=true",
                serde_json::json!({ "name": "twice" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_lifecycle_routes() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "cycle").await;
        let id = record["id"].as_str().unwrap();

        for (action, status) in [
            ("start", "running"),
            ("restart", "running"),
            ("stop", "stopped"),
        ] {
            let response = app
                .clone()
                .oneshot(empty_request(
                    "POST",
                    &format!("/api/containers/{}/{}", id, action),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", action);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["status"], status);
        }
    }

    #[tokio::test]
    async fn test_start_unknown_is_not_found() {
        let h = harness();
        let response = test_app(&h)
            .oneshot(empty_request("POST", "/api/containers/ghost/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_runtime_failure_is_bad_gateway() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "gateway").await;
        h.runtime.fail_on("start");
        let response = app
            .oneshot(empty_request(
                "POST",
                &format!("/api/containers/{}/start", record["id"].as_str().unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_update_limits() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "limited").await;
        let id = record["id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/api/containers/{}/limits", id),
                serde_json::json!({ "cpu_cores": 2.0, "memory_mb": 4096 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let item: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(item["cpu_limit"], 2.0);
        assert_eq!(item["memory_limit"], 4096);

        let response = app
            .oneshot(json_request(
                "PATCH",
                &format!("/api/containers/{}/limits", id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "gone").await;
        let uri = format!("/api/containers/{}?force=true", record["id"].as_str().unwrap());

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(outcome["already_deleted"], false);

        let response = app.oneshot(empty_request("DELETE", &uri)).await.unwrap();
        let outcome: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(outcome["already_deleted"], true);
    }

    #[tokio::test]
    async fn test_metrics_history_route() {
        let h = harness();
        let app = test_app(&h);
        let record = create_waiting(&app, "measured").await;
        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/api/containers/{}/metrics?limit=5", record["id"].as_str().unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let samples: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(samples.is_empty());

        let response = app
            .oneshot(empty_request("GET", "/api/containers/ghost/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_routes() {
        let h = harness();
        let app = test_app(&h);
        h.orchestrator
            .tasks()
            .create_with_id("t-1", dockyard_common::TaskType::StartContainer);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/tasks"))
            .await
            .unwrap();
        let tasks: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(tasks.len(), 1);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/tasks/t-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/api/tasks/t-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reconcile_route() {
        let h = harness();
        let response = test_app(&h)
            .oneshot(empty_request("POST", "/api/reconcile"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(report["removed"], 0);
    }
}
