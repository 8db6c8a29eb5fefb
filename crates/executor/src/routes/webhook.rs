use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use common::models::TradeSignal;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub action: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    #[serde(default)]
    pub price: Option<f64>,
    pub secret: String,
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
}

/// Inbound signal endpoint. A bad secret or malformed intent rejects the
/// request; anything past that always answers 200 with one entry per
/// dispatched tenant, even when every tenant failed.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    if payload.secret != state.webhook_secret {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "message": "Invalid secret" })),
        )
            .into_response();
    }

    let Ok(action) = payload.action.parse() else {
        return bad_request("Unsupported action");
    };
    let Ok(side) = payload.side.parse() else {
        return bad_request("Unsupported side");
    };
    let Ok(order_type) = payload.order_type.parse() else {
        return bad_request("Unsupported order type");
    };
    if payload.symbol.trim().is_empty() {
        return bad_request("Missing symbol");
    }

    let signal = TradeSignal {
        action,
        symbol: payload.symbol,
        side,
        order_type,
        price: payload.price,
    };

    match state.dispatcher.dispatch_signal(&signal).await {
        Ok(results) => (
            StatusCode::OK,
            Json(json!({ "message": "Orders processed", "results": results })),
        )
            .into_response(),
        Err(e) => {
            error!("dispatch round failed before fan-out: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "dispatch failed" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use common::models::TenantConfig;
    use engine::{DcaEngine, Dispatcher};
    use exchange::{Connector, Exchange, ExchangeError};

    struct NoConnector;

    #[async_trait]
    impl Connector for NoConnector {
        async fn connect(
            &self,
            _tenant: &TenantConfig,
        ) -> Result<Arc<dyn Exchange>, ExchangeError> {
            Err(ExchangeError::Network("not reachable in tests".into()))
        }
    }

    async fn test_state() -> Arc<AppState> {
        let pool = storage::db::connect_in_memory().await.unwrap();
        let connector = Arc::new(NoConnector);
        Arc::new(AppState {
            dispatcher: Dispatcher::new(pool.clone(), connector.clone()),
            dca: DcaEngine::new(pool, connector),
            webhook_secret: "hunter2".to_string(),
        })
    }

    fn payload(secret: &str, action: &str) -> WebhookPayload {
        WebhookPayload {
            action: action.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "buy".to_string(),
            order_type: "market".to_string(),
            price: None,
            secret: secret.to_string(),
        }
    }

    #[tokio::test]
    async fn rejects_a_bad_secret() {
        let state = test_state().await;
        let response = handle(State(state), Json(payload("wrong", "open"))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rejects_unsupported_actions() {
        let state = test_state().await;
        let response = handle(State(state), Json(payload("hunter2", "liquidate"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_round_still_answers_ok() {
        let state = test_state().await;
        let response = handle(State(state), Json(payload("hunter2", "open"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
