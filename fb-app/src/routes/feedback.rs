use crate::feedback::FeedbackOutcome;
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    summary: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/feedback", post(request_feedback))
}

/// Blocks until the remote operator replies or the timeout passes.
#[tracing::instrument(level = "info", skip_all)]
async fn request_feedback(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<FeedbackRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.summary.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": "summary is required" })),
        );
    }

    let timeout = state.feedback_timeout(req.timeout_secs);
    let outcome = state.relay.request_feedback(&req.summary, timeout).await;
    let status = match outcome {
        FeedbackOutcome::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FeedbackOutcome::Reply { .. }
        | FeedbackOutcome::TimedOut { .. }
        | FeedbackOutcome::Expired { .. } => StatusCode::OK,
    };
    let body = serde_json::to_value(&outcome).unwrap_or_else(|e| {
        serde_json::json!({ "status": "error", "error": format!("encode outcome: {e}") })
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use crate::feedback::FeedbackRelay;
    use crate::server::{AppState, app_router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    fn disabled_state() -> Arc<AppState> {
        Arc::new(AppState {
            relay: Arc::new(FeedbackRelay::disabled()),
            started_at: Instant::now(),
            default_feedback_timeout_secs: 600,
            request_timeout: Duration::from_secs(60),
            max_in_flight: 8,
        })
    }

    fn post_feedback(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/feedback")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn feedback_without_bridge_is_unavailable() {
        let app = app_router(disabled_state(), None);
        let response = app
            .oneshot(post_feedback(serde_json::json!({ "summary": "done?" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "unavailable");
    }

    #[tokio::test]
    async fn empty_summary_is_bad_request() {
        let app = app_router(disabled_state(), None);
        let response = app
            .oneshot(post_feedback(serde_json::json!({ "summary": "  " })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_status_report_disabled_bridge() {
        let app = app_router(disabled_state(), None);
        let health = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(body_json(health).await["bridge_enabled"], false);

        let status = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/bridge/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(body_json(status).await["enabled"], false);
    }

    #[test]
    fn feedback_timeout_is_capped_below_request_timeout() {
        let state = disabled_state();
        assert_eq!(state.feedback_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(state.feedback_timeout(None), Duration::from_secs(55));
        assert_eq!(state.feedback_timeout(Some(10_000)), Duration::from_secs(55));
    }
}
