use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::scheduler::StatsSnapshot;
use crate::AppState;

/// GET /status - queue depth, in-flight executions and running totals
async fn status(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(state)
}
