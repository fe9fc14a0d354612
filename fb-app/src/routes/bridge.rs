use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/bridge/status", get(get_status))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.relay.bridge() {
        Some(bridge) => Json(serde_json::json!({
            "enabled": true,
            "chat_id": bridge.chat_id(),
            "status": bridge.status(),
        })),
        None => Json(serde_json::json!({ "enabled": false })),
    }
}
