use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sidecar_proto::SessionReport;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::state::AppState;

async fn health() -> &'static str {
    "healthy!"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

/// `jibriId` or `componentId`, whichever the component sends.
fn reporter_id(body: &Value) -> Option<&str> {
    body.get("jibriId")
        .or_else(|| body.get("componentId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn push_outcome(result: Result<(), crate::channel::ChannelError>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "OK" }))),
        Err(err) => {
            warn!(error = %err, "failed to forward webhook update");
            (StatusCode::OK, Json(json!({ "status": "ERROR" })))
        }
    }
}

async fn status_hook(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(id) = reporter_id(&body) else {
        return bad_request("jibriId or componentId is required");
    };
    let Some(status) = body.get("status").filter(|s| !s.is_null()) else {
        return bad_request("status is required");
    };
    debug!(component_id = %id, "status update received");
    push_outcome(state.pipeline().publish_status(status.clone()).await)
}

async fn session_hook(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(id) = reporter_id(&body) else {
        return bad_request("jibriId or componentId is required");
    };
    let Some(session) = body.get("session").filter(|s| !s.is_null()) else {
        return bad_request("session is required");
    };
    let report: SessionReport = match serde_json::from_value(session.clone()) {
        Ok(report) => report,
        Err(err) => return bad_request(format!("invalid session: {err}")),
    };
    info!(
        component_id = %id,
        session_id = %report.session_id,
        status = ?report.status,
        "session update received"
    );
    push_outcome(state.pipeline().publish_session(report).await)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/hook/v1/status", post(status_hook))
        .route("/hook/v1/session-status", post(session_hook))
        .with_state(state)
}
