//! Consume raw event batches from the intake queue, deduplicate them and store them.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use track_cleaner::config::{Config, SinkKind};
use track_cleaner::consumer::CleanerWorker;
use track_cleaner::router::router;
use track_cleaner::sink::{EventSink, PgSink, PrintSink};
use track_common::health::HealthRegistry;
use track_common::intake::{IntakeQueue, RedisQueue};
use track_common::metrics::setup_metrics_routes;

// Each worker reports once per loop iteration, which lasts at most a pop timeout
// plus the processing of one batch
const LIVENESS_SLACK: Duration = Duration::from_secs(30);

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn create_sink(config: &Config) -> Result<Arc<dyn EventSink + Send + Sync>> {
    match config.sink {
        SinkKind::Print => Ok(Arc::new(PrintSink {})),
        SinkKind::Postgres => {
            let sink = PgSink::new(
                &config.database_url,
                config.table_name.as_str(),
                config.max_pg_connections,
            )
            .await?;

            if config.run_migrations {
                sink.migrate().await?;
                tracing::info!("migrations applied");
            }

            Ok(Arc::new(sink))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let sink = create_sink(&config).await?;

    let queue: Arc<dyn IntakeQueue + Send + Sync> = Arc::new(RedisQueue::new(
        &config.redis_url,
        config.queue_name.as_str(),
    )?);
    let dead_letter: Option<Arc<dyn IntakeQueue + Send + Sync>> = match &config.dead_letter_queue
    {
        Some(name) => Some(Arc::new(RedisQueue::new(
            &config.redis_url,
            name.as_str(),
        )?)),
        None => None,
    };

    let pop_timeout = config.pop_timeout.as_timeout();
    let deadline = pop_timeout.unwrap_or_default() + LIVENESS_SLACK;
    if pop_timeout.is_none() {
        tracing::warn!("pops block without timeout, an idle worker will be reported as stalled");
    }

    let mut workers = JoinSet::new();
    for index in 0..config.worker_count.max(1) {
        let name = format!("cleaner-worker-{}", index);
        let worker_liveness = liveness.register(name.clone(), deadline).await;

        let mut worker = CleanerWorker::new(&name, queue.clone(), sink.clone(), worker_liveness)
            .pop_timeout(pop_timeout)
            .error_backoff(config.error_backoff.0)
            .retry_policy(config.retry_policy.policy());
        if let Some(dead_letter) = &dead_letter {
            worker = worker.dead_letter(dead_letter.clone());
        }

        workers.spawn(async move { worker.run().await });
    }
    tracing::info!(
        workers = workers.len(),
        queue = config.queue_name.as_str(),
        "cleaner started"
    );

    let router = setup_metrics_routes(router(queue, liveness))?;

    tokio::select! {
        served = listen(router, config.bind()) => served?,
        _ = workers.join_next() => tracing::error!("a cleaner worker exited unexpectedly"),
        _ = shutdown() => {},
    }

    Ok(())
}
