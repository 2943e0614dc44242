use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use dataflow_core::error::FlowError;
use dataflow_core::{flows, scheduler};

use crate::auth::{self, AuthRejection, TOKEN_HEADER};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/flows", get(list_flows))
        .route("/flows/{name}/status", patch(toggle_status))
        .route("/flows/{name}/run", post(run_flow))
        .with_state(state)
}

/// One scheduler tick, guarded by the shared-secret and allowlist checks.
/// The response is always structured JSON: a `TickSummary` on success, an
/// `{"error": …}` body otherwise.
async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if let Err(rejection) = auth::authorize(&state.heartbeat, token, addr.ip()) {
        return match rejection {
            AuthRejection::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
            }
            AuthRejection::Forbidden => {
                (StatusCode::FORBIDDEN, Json(json!({"error": "Forbidden"}))).into_response()
            }
        };
    }

    match scheduler::run_tick(&state.pool, &state.registry).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            error!("heartbeat tick failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn list_flows(State(state): State<AppState>) -> Response {
    match flows::list_flows(&state.pool).await {
        Ok(list) => Json(list).into_response(),
        Err(err) => flow_error_response(err),
    }
}

async fn toggle_status(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match flows::toggle_status(&state.pool, &name).await {
        Ok(status) => Json(json!({"name": name, "status": status})).into_response(),
        Err(err) => flow_error_response(err),
    }
}

/// Synchronous manual trigger, outside the heartbeat cycle but through the
/// same executor contract; the flow's error message comes back to the
/// caller.
async fn run_flow(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match scheduler::trigger_flow(&state.pool, &state.registry, &name).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => flow_error_response(err),
    }
}

fn flow_error_response(err: FlowError) -> Response {
    let status = match &err {
        FlowError::FlowNotFound(_) => StatusCode::NOT_FOUND,
        FlowError::FlowBusy(_) => StatusCode::CONFLICT,
        FlowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    if status.is_server_error() {
        error!("request failed: {err}");
    }
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
