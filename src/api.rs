// src/api.rs
use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

use crate::pipeline::{Pipeline, PipelineError};
use crate::progress::ProgressHub;

pub const WELCOME_MESSAGE: &str = "Welcome to the Crop Mapping API!";
pub const CONNECTED_MESSAGE: &str = "WebSocket Connected";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub hub: Arc<ProgressHub>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, hub: Arc<ProgressHub>) -> Self {
        Self { pipeline, hub }
    }
}

/// Public router builder.
pub fn router(state: AppState) -> Router {
    create_router(state)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Json(json!({ "message": WELCOME_MESSAGE })) }))
        .route("/test", get(|| async { Json(json!({ "message": "Test route working!" })) }))
        .route("/health", get(|| async { "OK" }))
        .route("/fetch-bands", post(fetch_bands))
        .route("/ws/progress", get(ws_progress))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchBandsReq {
    #[serde(default)]
    geojson: Value,
    /// `true` asks for prediction-backed output.
    #[serde(default)]
    flag: bool,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error_response(status, self.to_string())
    }
}

async fn fetch_bands(
    State(state): State<AppState>,
    body: Result<Json<FetchBandsReq>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(rej) => {
            tracing::debug!(error = %rej.body_text(), "rejected fetch-bands body");
            return error_response(StatusCode::BAD_REQUEST, rej.body_text());
        }
    };

    let request = match state.pipeline.prepare(
        req.geojson,
        req.flag,
        req.start_date.as_deref(),
        req.end_date.as_deref(),
    ) {
        Ok(r) => r,
        Err(e) => return PipelineError::from(e).into_response(),
    };

    match state.pipeline.run_isolated(request).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ws_progress(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

/// Relays every event on the pipeline topic to one client until either side hangs up.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let topic = state.pipeline.topic().to_string();
    let mut rx = state.hub.subscribe(&topic);
    tracing::debug!(topic = %topic, "progress subscriber connected");

    if socket.send(text(json!({ "message": CONNECTED_MESSAGE }))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(t))) => {
                    let echo = json!({ "message": format!("Received: {}", t.as_str()) });
                    if socket.send(text(echo)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            event = rx.recv() => match event {
                Ok(ev) => {
                    let payload = match serde_json::to_value(&ev) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "progress event not serializable");
                            continue;
                        }
                    };
                    if socket.send(text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %topic, skipped, "progress subscriber lagging; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(topic = %topic, "progress subscriber disconnected");
}
