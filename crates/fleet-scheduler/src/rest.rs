//! REST admission and observability surface
//!
//! Validates submissions and funnels them into the state manager's
//! task-submit operation; reads expose the authoritative state. Only a
//! primary accepts submissions and quota changes.

use crate::engine::Engine;
use crate::services::RoleAdapter;
use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_core::{Error, GpuStatus, Priority, Task};
use fleet_state::StateManager;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
struct AppState {
    state: StateManager,
    engine: Arc<Engine>,
    role: RoleAdapter,
}

/// HTTP server for the admission API
pub struct RestServer {
    state: StateManager,
    engine: Arc<Engine>,
    role: RoleAdapter,
}

impl RestServer {
    pub fn new(state: StateManager, engine: Arc<Engine>, role: RoleAdapter) -> Self {
        Self {
            state,
            engine,
            role,
        }
    }

    /// Serve until the shutdown signal flips.
    pub async fn serve(
        self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> fleet_core::Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::transport(format!("failed to bind {}: {}", addr, e)))?;

        info!("REST API listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::transport(format!("REST server failed: {}", e)))?;

        info!("REST API stopped");
        Ok(())
    }

    fn router(self) -> Router {
        let app_state = AppState {
            state: self.state,
            engine: self.engine,
            role: self.role,
        };

        Router::new()
            .route("/api/v1/tasks", post(create_task).get(list_tasks))
            .route("/api/v1/tasks/:id", get(get_task).delete(cancel_task))
            .route("/api/v1/gpus", get(list_gpus))
            .route("/api/v1/quota", get(get_quota).put(update_quota))
            .route("/health", get(health))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(app_state)
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    priority: String,
    gpu_count: u32,
    #[serde(default)]
    gpu_model: Option<String>,
    command: String,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct UpdateQuotaRequest {
    online_percent: f64,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

async fn create_task(
    State(app): State<AppState>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    if !app.role.is_primary() {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "submissions are only accepted by the primary scheduler",
        );
    }

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {}", rejection.body_text()),
            )
        }
    };

    if req.command.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "command is required");
    }
    if req.gpu_count == 0 {
        return error_body(StatusCode::BAD_REQUEST, "gpu_count must be positive");
    }
    let priority: Priority = match req.priority.parse() {
        Ok(priority) => priority,
        Err(_) => {
            return error_body(StatusCode::BAD_REQUEST, "priority must be 'high' or 'low'")
        }
    };

    let mut task = Task::new(
        format!("task-{}", Uuid::new_v4()),
        priority,
        req.gpu_count,
        req.command,
    )
    .with_env(req.env);
    task.gpu_model = req.gpu_model;

    let task_id = task.id.clone();
    let created_at = task.created_at;

    if let Err(e) = app.state.submit_task(task).await {
        error!(task_id, "Task submission failed: {}", e);
        return error_body(
            StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            e.to_string(),
        );
    }

    app.engine.wake();

    (
        StatusCode::CREATED,
        Json(json!({
            "task_id": task_id,
            "status": "pending",
            "created_at": created_at.to_rfc3339(),
        })),
    )
}

async fn list_tasks(State(app): State<AppState>) -> (StatusCode, Json<Value>) {
    let tasks = app.state.list_tasks().await;
    (
        StatusCode::OK,
        Json(json!({
            "total": tasks.len(),
            "tasks": tasks,
        })),
    )
}

async fn get_task(
    State(app): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match app.state.get_task(&task_id).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))),
        Err(_) => error_body(StatusCode::NOT_FOUND, "task not found"),
    }
}

async fn cancel_task(
    State(app): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match app.state.cancel_task(&task_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "message": "task cancelled" })),
        ),
        Err(Error::NotFound(_)) => error_body(StatusCode::NOT_FOUND, "task not found"),
        // Running and already-settled tasks alike refuse cancellation.
        Err(e) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn list_gpus(State(app): State<AppState>) -> (StatusCode, Json<Value>) {
    let gpus = app.state.list_gpus().await;

    let idle = gpus.iter().filter(|g| g.status == GpuStatus::Idle).count();
    let busy = gpus.iter().filter(|g| g.status == GpuStatus::Busy).count();
    let offline = gpus
        .iter()
        .filter(|g| g.status == GpuStatus::Offline)
        .count();

    (
        StatusCode::OK,
        Json(json!({
            "total": gpus.len(),
            "idle": idle,
            "busy": busy,
            "offline": offline,
            "gpus": gpus,
        })),
    )
}

async fn get_quota(State(app): State<AppState>) -> (StatusCode, Json<Value>) {
    let quota = app.state.get_quota().await;

    (
        StatusCode::OK,
        Json(json!({
            "total_gpus": quota.total_gpus,
            "online": {
                "quota": quota.online_quota,
                "used": quota.online_used,
                "available": quota.available(Priority::High),
            },
            "batch": {
                "quota": quota.batch_quota,
                "used": quota.batch_used,
                "available": quota.available(Priority::Low),
            },
        })),
    )
}

async fn update_quota(
    State(app): State<AppState>,
    payload: Result<Json<UpdateQuotaRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    if !app.role.is_primary() {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "quota changes are only accepted by the primary scheduler",
        );
    }

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {}", rejection.body_text()),
            )
        }
    };

    if !(0.0..=1.0).contains(&req.online_percent) {
        return error_body(
            StatusCode::BAD_REQUEST,
            "online_percent must be between 0 and 1",
        );
    }

    if let Err(e) = app
        .state
        .set_quota(req.online_percent, 1.0 - req.online_percent)
        .await
    {
        return error_body(StatusCode::BAD_REQUEST, e.to_string());
    }

    app.engine.wake();

    (StatusCode::OK, Json(json!({ "message": "quota updated" })))
}

async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::dispatch::DispatchRouter;
    use chrono::Utc;
    use fleet_core::Gpu;
    use std::time::Duration;

    fn make_app(role: Role) -> AppState {
        let (state, _rx) = StateManager::new();
        let dispatch = DispatchRouter::new(1024);
        let engine = Arc::new(Engine::new(
            state.clone(),
            dispatch,
            RoleAdapter::new("sched-test", role),
            Duration::from_secs(5),
            Some(3),
        ));
        AppState {
            state,
            engine,
            role: RoleAdapter::new("sched-test", role),
        }
    }

    fn create_req(priority: &str, gpu_count: u32, command: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            priority: priority.to_string(),
            gpu_count,
            gpu_model: None,
            command: command.to_string(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_task_returns_201() {
        let app = make_app(Role::Primary);

        let (status, body) = create_task(
            State(app.clone()),
            Ok(Json(create_req("high", 2, "train.sh"))),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.0["status"], "pending");
        let task_id = body.0["task_id"].as_str().unwrap().to_string();
        assert!(app.state.get_task(&task_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_task_validation_is_400() {
        let app = make_app(Role::Primary);

        let (status, _) =
            create_task(State(app.clone()), Ok(Json(create_req("high", 0, "x")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            create_task(State(app.clone()), Ok(Json(create_req("urgent", 1, "x")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            create_task(State(app), Ok(Json(create_req("high", 1, "")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_standby_rejects_submissions() {
        let app = make_app(Role::Standby);

        let (status, _) =
            create_task(State(app), Ok(Json(create_req("high", 1, "train.sh")))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_get_task_404_when_missing() {
        let app = make_app(Role::Primary);
        let (status, _) = get_task(State(app), Path("nope".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_pending_ok_running_400() {
        let app = make_app(Role::Primary);
        app.state
            .register_agent(
                "n1",
                "addr",
                vec![Gpu {
                    id: "n1-gpu-0".to_string(),
                    node_id: "n1".to_string(),
                    device_index: 0,
                    model: "A100".to_string(),
                    memory_bytes: 40_000_000_000,
                    status: GpuStatus::Idle,
                    current_task_id: None,
                    updated_at: Utc::now(),
                }],
            )
            .await
            .unwrap();
        app.state.set_quota(1.0, 0.0).await.unwrap();

        app.state
            .submit_task(Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();
        app.engine.run_cycle().await;

        // t1 is Running now; cancellation must refuse with 400.
        let (status, _) = cancel_task(State(app.clone()), Path("t1".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.state
            .submit_task(Task::new("t2", Priority::High, 1, "queued.sh"))
            .await
            .unwrap();
        let (status, _) = cancel_task(State(app.clone()), Path("t2".to_string())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = cancel_task(State(app), Path("ghost".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gpu_summary_counts() {
        let app = make_app(Role::Primary);
        app.state
            .register_agent(
                "n1",
                "addr",
                vec![
                    Gpu {
                        id: "n1-gpu-0".to_string(),
                        node_id: "n1".to_string(),
                        device_index: 0,
                        model: "A100".to_string(),
                        memory_bytes: 40_000_000_000,
                        status: GpuStatus::Idle,
                        current_task_id: None,
                        updated_at: Utc::now(),
                    },
                    Gpu {
                        id: "n1-gpu-1".to_string(),
                        node_id: "n1".to_string(),
                        device_index: 1,
                        model: "A100".to_string(),
                        memory_bytes: 40_000_000_000,
                        status: GpuStatus::Idle,
                        current_task_id: None,
                        updated_at: Utc::now(),
                    },
                ],
            )
            .await
            .unwrap();

        let (status, body) = list_gpus(State(app)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["total"], 2);
        assert_eq!(body.0["idle"], 2);
        assert_eq!(body.0["busy"], 0);
    }

    #[tokio::test]
    async fn test_quota_put_and_get() {
        let app = make_app(Role::Primary);
        app.state
            .register_agent(
                "n1",
                "addr",
                (0..4)
                    .map(|index| Gpu {
                        id: Gpu::make_id("n1", index),
                        node_id: "n1".to_string(),
                        device_index: index,
                        model: "A100".to_string(),
                        memory_bytes: 40_000_000_000,
                        status: GpuStatus::Idle,
                        current_task_id: None,
                        updated_at: Utc::now(),
                    })
                    .collect(),
            )
            .await
            .unwrap();

        let (status, _) = update_quota(
            State(app.clone()),
            Ok(Json(UpdateQuotaRequest {
                online_percent: 0.75,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_quota(State(app)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["total_gpus"], 4);
        assert_eq!(body.0["online"]["quota"], 3);
        assert_eq!(body.0["batch"]["quota"], 1);

        let app = make_app(Role::Primary);
        let (status, _) = update_quota(
            State(app),
            Ok(Json(UpdateQuotaRequest { online_percent: 1.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = health().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "healthy");
    }
}
