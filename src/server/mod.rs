//! The control API.
//!
//! Handlers translate HTTP requests into [`Supervisor`] calls and wrap the
//! result in the `{success, message, data}` envelope.

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::future::Future;
use tokio::net::TcpListener;

use crate::api::types::{
    ApiResponse, EventView, HealthResponse, LoadData, LoadedModel, ModelSummary, ReloadData,
    StatusData, UnloadData,
};
use crate::error::SupervisorError;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
}

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/api/models", get(list_models))
        .route("/api/models/reload", post(reload_models))
        .route("/api/status", get(status))
        .route("/api/load", post(load_model))
        .route("/api/unload", post(unload_model))
        .route("/api/events", get(events))
        .route("/api/health", get(health))
        .fallback(not_found)
        .layer(axum::middleware::from_fn(crate::middleware::cors_middleware))
        .with_state(AppState { supervisor })
}

/// Serves the control API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, supervisor: Supervisor, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(supervisor);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::error(message))).into_response()
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.supervisor.catalog();
    let models: Vec<ModelSummary> = catalog.entries().iter().map(ModelSummary::from).collect();
    Json(ApiResponse::ok(models))
}

async fn reload_models(State(state): State<AppState>) -> Response {
    let supervisor = state.supervisor.clone();
    match tokio::task::spawn_blocking(move || supervisor.reload_catalog()).await {
        Ok(Ok(count)) => Json(ApiResponse::ok_with_message(
            "Model list reloaded",
            ReloadData { count },
        ))
        .into_response(),
        Ok(Err(e)) => {
            tracing::warn!("Model list reload failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            tracing::error!("Model list reload task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Reload failed")
        }
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = &state.supervisor;
    let current = supervisor.current();
    let server_port = current
        .as_ref()
        .map(|i| i.port)
        .unwrap_or_else(|| supervisor.config().base_port);

    Json(ApiResponse::ok(StatusData {
        loaded: current.is_some(),
        model: current.map(|i| LoadedModel {
            base_name: i.base_name,
            path: i.path,
        }),
        server_port,
        instances: supervisor.status(),
    }))
}

async fn load_model(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(raw) = params.get("index") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing index parameter");
    };
    let Ok(index) = raw.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid index parameter");
    };

    match state.supervisor.load(index).await {
        Ok(outcome) => {
            let message = if outcome.already_loaded {
                "Model already loaded"
            } else {
                "Model loading"
            };
            let instance = outcome.instance;
            Json(ApiResponse::ok_with_message(
                message,
                LoadData {
                    path: instance.path,
                    base_name: instance.base_name,
                    port: instance.port,
                    instance: instance.id,
                },
            ))
            .into_response()
        }
        Err(e) if e.is_client_error() => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(SupervisorError::ShuttingDown) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, SupervisorError::ShuttingDown.to_string())
        }
        Err(e) => {
            tracing::error!("Load request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn unload_model(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let instance = match params.get("instance").map(|v| v.trim().parse::<u64>()) {
        None => None,
        Some(Ok(id)) => Some(id),
        Some(Err(_)) => return error_response(StatusCode::BAD_REQUEST, "Invalid instance parameter"),
    };

    let stopped = state.supervisor.unload(instance).await;
    Json(ApiResponse::ok_with_message(
        "Model unloaded",
        UnloadData {
            stopped: stopped.iter().map(|i| i.id).collect(),
        },
    ))
    .into_response()
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let events: Vec<EventView> = state
        .supervisor
        .events()
        .history()
        .into_iter()
        .map(EventView::from)
        .collect();
    Json(ApiResponse::ok(events))
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}
