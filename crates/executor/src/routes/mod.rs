use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use crate::state::AppState;

pub mod dca;
pub mod webhook;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook::handle))
        .route("/dca-run", post(dca::handle))
        .with_state(state)
}
