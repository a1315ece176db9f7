use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use track_common::health::{HealthHandle, HealthRegistry};
use track_common::intake::{IntakeQueue, RedisQueue};
use track_common::metrics::setup_metrics_routes;

use crate::config::Config;
use crate::router;

const QUEUE_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Keep the intake queue component alive in the liveness registry while redis
/// answers, and export its depth.
async fn probe_queue(queue: RedisQueue, liveness: HealthHandle) {
    let mut interval = tokio::time::interval(QUEUE_PROBE_INTERVAL);
    loop {
        interval.tick().await;
        match queue.depth().await {
            Ok(depth) => {
                metrics::gauge!("capture_intake_queue_depth").set(depth as f64);
                liveness.report_healthy().await;
            }
            Err(e) => tracing::warn!("intake queue probe failed: {}", e),
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let queue = RedisQueue::new(&config.redis_url, &config.queue_name)
        .context("failed to create redis client")?;
    let probe = RedisQueue::new(&config.redis_url, &config.queue_name)
        .context("failed to create redis client")?;

    let queue_liveness = liveness
        .register("intake_queue".to_string(), QUEUE_PROBE_INTERVAL * 3)
        .await;
    tokio::spawn(probe_queue(probe, queue_liveness));

    let app = router::router(queue, liveness, config.max_body_size);

    // Installing a global recorder is skipped when asked to, as in tests
    let app = if config.export_prometheus {
        setup_metrics_routes(app).context("failed to install metrics recorder")?
    } else {
        app
    };

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
