use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::state::AppState;

/// Parameterless tick across every tenant in dca mode; an external
/// scheduler calls this on a fixed interval.
pub async fn handle(State(state): State<Arc<AppState>>) -> Response {
    match state.dca.run_all().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({ "status": "dca run completed", "report": report })),
        )
            .into_response(),
        Err(e) => {
            error!("dca run failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "dca run failed", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
