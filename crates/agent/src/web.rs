use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::pump::{PumpArbiter, Source};
use crate::state::SharedSensors;

const WELCOME: &str = "Welcome to the IoT Agriculture System Server.";

#[derive(Clone)]
pub struct AppState {
    pub sensors: SharedSensors,
    pub arbiter: Arc<PumpArbiter>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/control", post(control))
        .route("/pump", get(pump))
        .fallback(index)
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html")], WELCOME)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sensors.get().await)
}

async fn pump(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.arbiter.state().await)
}

/// Map the `pump` field to on/off. Only the exact strings "on" and "off".
fn parse_pump_command(value: &Value) -> Option<bool> {
    match value.as_str()? {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Client mistakes are answered with 200 and an `error` body.
async fn control(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let req: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("control: malformed body: {e}");
            return (StatusCode::OK, Json(json!({"error": "Malformed request body"})));
        }
    };

    let Some(raw) = req.get("pump") else {
        return (StatusCode::OK, Json(json!({"error": "No pump command provided"})));
    };

    let Some(on) = parse_pump_command(raw) else {
        warn!(command = %raw, "control: invalid pump command");
        return (StatusCode::OK, Json(json!({"error": "Invalid pump command"})));
    };

    match state.arbiter.set_pump(on, Source::Remote).await {
        Ok(_) => {
            let msg = if on { "Pump turned ON" } else { "Pump turned OFF" };
            (StatusCode::OK, Json(json!({"status": msg})))
        }
        Err(e) => {
            tracing::error!("control: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Pump actuation failed"})),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind web port {host}:{port}"))
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("web api listening on http://{addr}");
    }
    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
