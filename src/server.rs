use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::scanner::{ProgressSnapshot, SharedProgress};

#[derive(Clone)]
pub struct AppState {
    progress: SharedProgress,
    instance_id: String,
    source: String,
}

impl AppState {
    pub fn new(progress: SharedProgress, instance_id: &str, source: &str) -> Self {
        Self {
            progress,
            instance_id: instance_id.to_string(),
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub instance_id: String,
    pub source: String,
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/found", get(get_found))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

/// Serve the status API on `bind` until `shutdown` fires.
pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("status API listening on http://{}/api/status", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let out = Status {
        instance_id: app.instance_id.clone(),
        source: app.source.clone(),
        progress: app.progress.snapshot().await,
    };
    (StatusCode::OK, Json(out))
}

async fn get_found(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.progress.found().await))
}
