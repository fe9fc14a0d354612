pub mod bridge;
pub mod feedback;
pub mod health;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(bridge::router())
        .merge(feedback::router())
}
