use crate::telegram::parse_webhook_update;
use crate::types::RemoteUpdate;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct WebhookState {
    secret: Option<String>,
    tx: mpsc::Sender<RemoteUpdate>,
}

/// Router that accepts Telegram webhook pushes at `POST /telegram/webhook` and
/// forwards each usable update into `tx`.
///
/// Non-2xx responses make Telegram redeliver, so a full or closed queue answers 503.
pub fn webhook_router(secret: Option<String>, tx: mpsc::Sender<RemoteUpdate>) -> Router {
    let secret = secret
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Router::new()
        .route("/telegram/webhook", post(receive_update))
        .with_state(WebhookState { secret, tx })
}

#[tracing::instrument(level = "info", skip_all)]
async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = state.secret.as_deref() {
        let provided = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !secret_matches(expected, provided) {
            tracing::warn!("telegram webhook rejected: secret token mismatch");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let update = match parse_webhook_update(&body) {
        Ok(Some(update)) => update,
        Ok(None) => return StatusCode::OK,
        Err(error) => {
            tracing::warn!(%error, "telegram webhook body could not be parsed");
            return StatusCode::BAD_REQUEST;
        }
    };

    let update_id = update.update_id;
    match state.tx.try_send(update) {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::warn!(%error, update_id, "telegram webhook queue unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Compare digests so the check does not short-circuit on the first differing byte
/// of the caller-controlled value.
fn secret_matches(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected
        .iter()
        .zip(provided.iter())
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
