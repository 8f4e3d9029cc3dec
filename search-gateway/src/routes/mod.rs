pub mod health;
pub mod search;
pub mod status;

use std::sync::Arc;

use axum::Router;

use crate::AppState;

/// All gateway routes, without middleware.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(search::router(state.clone()))
        .merge(status::router(state))
}
