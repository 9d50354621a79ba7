// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - REST API Module
// Control endpoints and the engine event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use vpn_engine_common::{ConnectRequest, EngineEvent};

use crate::manager::ConnectionManager;

/// Shared application state
pub struct AppState {
    pub manager: ConnectionManager,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

#[derive(Serialize)]
struct ConnectResponse {
    session_id: Uuid,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/cleanup", post(cleanup))
        .route("/api/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// Current engine status
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.status().await)
}

/// Start a session
async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> impl IntoResponse {
    info!("API: Connect request for location {}", request.location.id);

    if let Err(e) = request.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response();
    }

    match state.manager.connect(request).await {
        Ok(session_id) => {
            info!("Session {} starting", session_id);
            (StatusCode::ACCEPTED, Json(ConnectResponse { session_id })).into_response()
        }
        Err(e) => {
            error!("Failed to start session: {}", e);
            let msg = e.to_string();
            let status = if msg.contains("already active") {
                StatusCode::CONFLICT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(ErrorResponse { error: msg })).into_response()
        }
    }
}

/// Stop the session; answers once it is torn down
async fn disconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Disconnect request");

    match state.manager.disconnect().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: "Disconnected".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to disconnect: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Kill leftover tunnel processes and release DNS/firewall state
async fn cleanup(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Cleanup request");

    match state.manager.cleanup().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: "Cleanup complete".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Cleanup failed: {}", e);
            let msg = e.to_string();
            let status = if msg.contains("session is active") {
                StatusCode::CONFLICT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(ErrorResponse { error: msg })).into_response()
        }
    }
}

/// GET /api/events  → SSE stream of engine events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let engine_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => event_payload(&event).map(|json| Ok(Event::default().data(json))),
            Err(lagged) => {
                // Slow client; it catches up with later events
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(engine_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn event_payload(event: &EngineEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize engine event: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    event_payload(&EngineEvent::Heartbeat {
        timestamp: Utc::now(),
    })
    .unwrap_or_else(|| "{}".to_string())
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}
