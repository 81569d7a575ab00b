//! The HTTP surface (§6): a thin `axum` router translating each endpoint
//! into one `Engine` call.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json as AxumJson, Router};
use bpmn_lite_core::engine::Engine;
use bpmn_lite_core::types::Message;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/test", get(test))
        .route("/model", get(list_models))
        .route("/model/:name", get(get_model))
        .route("/model/:name/instance", post(create_instance))
        .route("/model/:name/task/:task_id/receive", post(receive_by_model))
        .route("/instance", get(search_instances))
        .route("/instance/:id", get(get_instance))
        .route("/instance/:id/task/:task_id", get(get_task))
        .route("/instance/:id/task/:task_id/form", post(submit_form))
        .route("/instance/:id/task/:task_id/receive", post(receive_by_instance))
        .route("/instance/:id/state", get(get_state))
        .route("/instance/:id/statews", get(state_websocket))
        .with_state(engine)
}

/// Errors that can surface out of an HTTP handler, mapped to a status code
/// per §7's "NotFound -> 404, BadRequest -> 400" boundary rule.
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "unhandled engine error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, AxumJson(json!({ "error": message }))).into_response()
    }
}

async fn test() -> &'static str {
    "ok"
}

async fn list_models(State(engine): State<Arc<Engine>>) -> AxumJson<Vec<String>> {
    AxumJson(engine.list_models().await)
}

async fn get_model(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<String, ApiError> {
    engine
        .model_source(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("no model named '{name}'")))
}

#[derive(Deserialize)]
struct CreateInstanceRequest {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    variables: Json,
}

async fn create_instance(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    AxumJson(request): AxumJson<CreateInstanceRequest>,
) -> Result<(StatusCode, AxumJson<Json>), ApiError> {
    let handle = engine
        .create_instance(&name, request.id, request.variables)
        .await
        .map_err(to_api_error)?;
    let snapshot = handle.snapshot().await;
    Ok((StatusCode::CREATED, AxumJson(serde_json::to_value(snapshot).unwrap())))
}

async fn search_instances(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<AxumJson<Json>, ApiError> {
    let query = params.get("q").map(|s| s.as_str());
    let snapshots = engine.search(query).await?;
    Ok(AxumJson(serde_json::to_value(snapshots).unwrap()))
}

async fn get_instance(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<AxumJson<Json>, ApiError> {
    let snapshot = engine
        .instance_snapshot(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no instance '{id}'")))?;
    Ok(AxumJson(serde_json::to_value(snapshot).unwrap()))
}

async fn get_task(
    State(engine): State<Arc<Engine>>,
    Path((id, task_id)): Path<(Uuid, String)>,
) -> Result<AxumJson<Json>, ApiError> {
    let snapshot = engine
        .instance_snapshot(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no instance '{id}'")))?;
    let pending = snapshot.pending.iter().any(|p| p == &task_id);
    Ok(AxumJson(json!({ "task_id": task_id, "pending": pending })))
}

async fn get_state(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<AxumJson<Json>, ApiError> {
    let snapshot = engine
        .instance_snapshot(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no instance '{id}'")))?;
    Ok(AxumJson(json!({ "state": snapshot.state.to_string() })))
}

async fn submit_form(
    State(engine): State<Arc<Engine>>,
    Path((id, task_id)): Path<(Uuid, String)>,
    AxumJson(payload): AxumJson<Json>,
) -> Result<StatusCode, ApiError> {
    let delivered = engine
        .deliver_message(id, Message::UserForm { task_id, payload })
        .await?;
    if delivered {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound(format!("no instance '{id}'")))
    }
}

async fn receive_by_instance(
    State(engine): State<Arc<Engine>>,
    Path((id, task_id)): Path<(Uuid, String)>,
    AxumJson(payload): AxumJson<Json>,
) -> Result<StatusCode, ApiError> {
    let delivered = engine
        .deliver_message(id, Message::Receive { task_id, payload })
        .await?;
    if delivered {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound(format!("no instance '{id}'")))
    }
}

/// Creates a fresh instance of `name` and immediately delivers the
/// `Receive` to it, rather than addressing an already-running instance
/// (§6 — this is the "auto receive" entry point, distinct from
/// `/instance/:id/task/:task_id/receive`).
async fn receive_by_model(
    State(engine): State<Arc<Engine>>,
    Path((name, task_id)): Path<(String, String)>,
    AxumJson(payload): AxumJson<Json>,
) -> Result<(StatusCode, AxumJson<Json>), ApiError> {
    let id = engine
        .create_instance_and_receive(&name, &task_id, payload)
        .await
        .map_err(to_api_error)?;
    Ok((
        StatusCode::CREATED,
        AxumJson(json!({ "status": "OK", "id_instance": id })),
    ))
}

async fn state_websocket(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_state(socket, engine, id))
}

/// Poll the instance every 3s and push its state until it reaches a
/// terminal state or the client disconnects (§6).
async fn stream_state(mut socket: WebSocket, engine: Arc<Engine>, id: Uuid) {
    loop {
        let snapshot = match engine.instance_snapshot(id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let _ = socket
                    .send(WsMessage::Text(json!({ "error": "not found" }).to_string()))
                    .await;
                return;
            }
            Err(err) => {
                tracing::warn!(instance_id = %id, error = %err, "statews poll failed");
                return;
            }
        };
        let is_terminal = snapshot.state.is_terminal();
        let text = json!({ "state": snapshot.state.to_string() }).to_string();
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
        if is_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

fn to_api_error(err: anyhow::Error) -> ApiError {
    ApiError::BadRequest(err.to_string())
}
