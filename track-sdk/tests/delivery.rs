use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use track_sdk::cache::{CacheStore, FileCache, QUEUE_SLOT};
use track_sdk::{FlushOutcome, Monitor, MonitorError, MonitorOptions, RouteObserver};

#[derive(Clone, Default)]
struct Collector {
    reject: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    fn events(&self) -> Vec<Value> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .flat_map(|body| body["events"].as_array().cloned().unwrap_or_default())
            .collect()
    }
}

async fn report(State(collector): State<Collector>, Json(body): Json<Value>) -> StatusCode {
    let rejecting = collector
        .reject
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejecting {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    collector.bodies.lock().unwrap().push(body);
    StatusCode::OK
}

async fn serve(collector: Collector) -> String {
    let app = Router::new()
        .route("/report", post(report))
        .with_state(collector);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    format!("http://{}/report", addr)
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn batched_events_reach_the_collector() {
    let collector = Collector::default();
    let endpoint = serve(collector.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let options = MonitorOptions::new(endpoint).batched(3).user_id("u1");
    let monitor = Monitor::builder(options)
        .cache(FileCache::new(dir.path()).unwrap())
        .start("https://app.test/")
        .unwrap();

    // pv and uv are pending; the click reaches the threshold
    monitor.click(Some("buy"), "https://app.test/");

    eventually(|| collector.events().len() == 3).await;
    let types: Vec<Value> = collector
        .events()
        .iter()
        .map(|e| e["type"].clone())
        .collect();
    assert_eq!(types, vec![json!("pv"), json!("uv"), json!("click")]);
    assert!(collector.events().iter().all(|e| e["userId"] == json!("u1")));
}

#[tokio::test]
async fn rejected_batch_is_retried_in_order() {
    let collector = Collector::default();
    collector.reject.store(1, Ordering::SeqCst);
    let endpoint = serve(collector.clone()).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let options = MonitorOptions::new(endpoint)
        .batched(100)
        .retry_interval(Duration::from_millis(50))
        .user_id("u1");
    let monitor = Monitor::builder(options).start("https://app.test/").unwrap();
    let seen = errors.clone();
    monitor.on_error(move |error| {
        if matches!(error, MonitorError::Delivery { .. }) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(monitor.flush().await, FlushOutcome::Failed);
    assert_eq!(monitor.pending().len(), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    eventually(|| collector.events().len() == 2).await;
    eventually(|| monitor.pending().is_empty()).await;

    let types: Vec<Value> = collector
        .events()
        .iter()
        .map(|e| e["type"].clone())
        .collect();
    assert_eq!(types, vec![json!("pv"), json!("uv")]);
}

#[tokio::test]
async fn undelivered_events_survive_restart() {
    let collector = Collector::default();
    collector.reject.store(1, Ordering::SeqCst);
    let endpoint = serve(collector.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let options = MonitorOptions::new(endpoint).batched(100).user_id("u1");

    {
        let monitor = Monitor::builder(options.clone())
            .cache(FileCache::new(dir.path()).unwrap())
            .start("https://app.test/")
            .unwrap();
        monitor.on_navigate("https://app.test/docs");
        assert_eq!(monitor.teardown().await, FlushOutcome::Failed);
    }

    let cache = FileCache::new(dir.path()).unwrap();
    assert!(cache.load(QUEUE_SLOT).unwrap().is_some());

    let monitor = Monitor::builder(options)
        .cache(cache)
        .start("https://app.test/docs")
        .unwrap();
    assert_eq!(monitor.teardown().await, FlushOutcome::Sent(7));

    let types: Vec<Value> = collector
        .events()
        .iter()
        .map(|e| e["type"].clone())
        .collect();
    assert_eq!(
        types,
        vec![
            json!("pv"),
            json!("uv"),
            json!("route"),
            json!("pv"),
            json!("stay"),
            json!("pv"),
            json!("stay"),
        ]
    );
    assert!(FileCache::new(dir.path())
        .unwrap()
        .load(QUEUE_SLOT)
        .unwrap()
        .is_none());
}
