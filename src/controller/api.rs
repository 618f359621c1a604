//! HTTP control API for managing tasks at runtime.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use super::{RegistryError, TaskRegistry};
use crate::model::TaskDefinition;
use crate::transport::Publisher;

/// Routes:
/// - `GET /api/tasks`, `POST /api/tasks`
/// - `POST /api/retasks` (same as create; replaces by metric name)
/// - `GET /api/tasks/:id`, `DELETE /api/tasks/:id`
pub fn router<P: Publisher>(registry: Arc<TaskRegistry<P>>) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks::<P>).post(create_task::<P>))
        .route("/api/retasks", post(create_task::<P>))
        .route(
            "/api/tasks/:id",
            get(get_task::<P>).delete(delete_task::<P>),
        )
        .with_state(registry)
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };

        error_response(status, self.to_string())
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn list_tasks<P: Publisher>(
    State(registry): State<Arc<TaskRegistry<P>>>,
) -> Json<Vec<TaskDefinition>> {
    Json(registry.list())
}

async fn create_task<P: Publisher>(
    State(registry): State<Arc<TaskRegistry<P>>>,
    body: Result<Json<TaskDefinition>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskDefinition>), Response> {
    let Json(task) = body.map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid task: {}", rejection.body_text()),
        )
    })?;

    registry
        .add_or_replace(task.clone())
        .map_err(IntoResponse::into_response)?;

    info!(task = %task.metric_name, nodes = task.node_names.len(), "task registered via api");

    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task<P: Publisher>(
    State(registry): State<Arc<TaskRegistry<P>>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDefinition>, RegistryError> {
    registry
        .get(&id)
        .map(Json)
        .ok_or(RegistryError::NotFound(id))
}

async fn delete_task<P: Publisher>(
    State(registry): State<Arc<TaskRegistry<P>>>,
    Path(id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    registry.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
