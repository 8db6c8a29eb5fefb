use std::env;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing::info;

use common::logger;
use engine::{DcaEngine, Dispatcher};
use exchange::LiveConnector;

use crate::cipher::PlainCipher;
use crate::state::AppState;

mod cipher;
mod routes;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    logger::setup_logger();

    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/bot.db".to_string());
    let webhook_secret = env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET not set")?;
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let pool = storage::db::connect(&db_path).await?;
    let connector = Arc::new(LiveConnector::new(Arc::new(PlainCipher)));

    let state = Arc::new(AppState {
        dispatcher: Dispatcher::new(pool.clone(), connector.clone()),
        dca: DcaEngine::new(pool, connector),
        webhook_secret,
    });

    let app = routes::router(state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
