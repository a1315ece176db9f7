use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use track_common::health::HealthRegistry;
use track_common::intake::IntakeQueue;

use crate::report;

#[derive(Clone)]
pub struct State {
    pub queue: Arc<dyn IntakeQueue + Send + Sync>,
}

async fn index() -> &'static str {
    "track capture"
}

async fn readiness(state: axum::extract::State<State>) -> (StatusCode, String) {
    match state.queue.depth().await {
        Ok(depth) => (StatusCode::OK, format!("intake queue depth: {}", depth)),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub fn router<Q: IntakeQueue + Send + Sync + 'static>(
    queue: Q,
    liveness: HealthRegistry,
    max_body_size: usize,
) -> Router {
    let state = State {
        queue: Arc::new(queue),
    };

    // Browser SDKs post from any origin
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/report", post(report::report))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
