use std::future::ready;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use track_common::health::HealthRegistry;
use track_common::intake::IntakeQueue;

async fn index() -> &'static str {
    "track cleaner"
}

/// Ready while the intake queue answers.
async fn readiness(
    State(queue): State<Arc<dyn IntakeQueue + Send + Sync>>,
) -> (StatusCode, String) {
    match queue.depth().await {
        Ok(depth) => (StatusCode::OK, format!("intake queue depth: {}", depth)),
        Err(e) => {
            tracing::warn!("readiness probe failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

pub fn router(queue: Arc<dyn IntakeQueue + Send + Sync>, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .with_state(queue)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use track_common::intake::{MemoryQueue, QueueError};

    use super::*;

    struct UnreachableQueue;

    #[async_trait]
    impl IntakeQueue for UnreachableQueue {
        async fn push(&self, _batch: String) -> Result<(), QueueError> {
            Err(QueueError::Timeout { command: "RPUSH" })
        }

        async fn pop_blocking(
            &self,
            _wait: Option<Duration>,
        ) -> Result<Option<String>, QueueError> {
            Err(QueueError::Timeout { command: "BLPOP" })
        }

        async fn depth(&self) -> Result<usize, QueueError> {
            Err(QueueError::Timeout { command: "LLEN" })
        }
    }

    fn get_readiness() -> Request<Body> {
        Request::builder()
            .uri("/_readiness")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn readiness_reports_queue_depth() {
        let queue = MemoryQueue::new();
        queue.push("[]".to_owned()).await.unwrap();
        queue.push("[]".to_owned()).await.unwrap();

        let response = router(Arc::new(queue), HealthRegistry::new("liveness"))
            .oneshot(get_readiness())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"intake queue depth: 2");
    }

    #[tokio::test]
    async fn unreachable_queue_is_not_ready() {
        let response = router(Arc::new(UnreachableQueue), HealthRegistry::new("liveness"))
            .oneshot(get_readiness())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_fails_without_workers() {
        let response = router(Arc::new(MemoryQueue::new()), HealthRegistry::new("liveness"))
            .oneshot(
                Request::builder()
                    .uri("/_liveness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
