pub mod auth;
pub mod presence;
pub mod records;
pub mod relay;
pub mod session;
pub mod state;
pub mod timeout;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Ringing sessions expire after this many seconds unless accepted.
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 60;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
