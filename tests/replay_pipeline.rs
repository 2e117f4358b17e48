// tests/replay_pipeline.rs
// End to end: JSONL capture -> normalizer -> buffer -> local HTTP endpoint.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::Router;
use polarity_stream::config::{AppConfig, FileConfig};
use polarity_stream::build_pipeline;

async fn spawn_endpoint() -> (String, Arc<Mutex<Vec<String>>>) {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/v0/datasources",
            post(|State(b): State<Arc<Mutex<Vec<String>>>>, body: String| async move {
                b.lock().unwrap().push(body);
                "{}"
            }),
        )
        .with_state(bodies.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v0"), bodies)
}

#[tokio::test]
async fn replay_capture_reaches_the_endpoint() {
    let (api_url, bodies) = spawn_endpoint().await;
    let fixture = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/stream_sample.jsonl");

    let cfg = AppConfig::resolve(FileConfig::default(), |k| match k {
        "INGEST_TOKEN" => Some("t".into()),
        "INGEST_API_URL" => Some(api_url.clone()),
        "STREAM_REPLAY_PATH" => Some(fixture.into()),
        "FLUSH_MAX_RECORDS" => Some("2".into()),
        _ => None,
    })
    .unwrap();

    let manager = build_pipeline(&cfg).unwrap();
    let stats = manager
        .run_until_shutdown(tokio::time::sleep(Duration::from_millis(500)))
        .await;

    assert_eq!(stats.records_delivered, 3);
    assert_eq!(stats.batches_delivered, 2);

    let bodies = bodies.lock().unwrap();
    let all = bodies.join("");
    assert!(all.contains("1239000000000000001,\"2020-03-14 10:00:00\",\"Stay home stay safe\",\"covid\","));
    assert!(all.contains("\"This is terrible sad news about the lockdown\""));
    assert!(all.contains("1239000000000000003,\"2020-03-14 10:00:09\",\"not bad at all\""));
}
