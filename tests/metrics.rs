// tests/metrics.rs
use std::sync::Arc;

use http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;
use polarity_stream::ingest::{MicroBatchBuffer, NormalizedRecord, Normalizer};
use polarity_stream::sentiment::PolarityScorer;
use tower::ServiceExt;

struct Panics;

impl PolarityScorer for Panics {
    fn polarity(&self, _text: &str) -> anyhow::Result<f64> {
        panic!("scorer blew up")
    }
}

#[tokio::test]
async fn metrics_route_renders_pipeline_series() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        polarity_stream::ingest::ensure_metrics_described();

        let buf = MicroBatchBuffer::new();
        buf.append(NormalizedRecord {
            id: 1,
            timestamp: "2020-03-14 10:00:00".into(),
            text: "hi".into(),
            tag: "covid".into(),
            polarity: 0.0,
        });

        let n = Normalizer::new(Arc::new(Panics), "covid");
        let ev = polarity_stream::ingest::InboundEvent {
            id: 2,
            created_at: "2020-03-14T10:00:00Z".into(),
            text: "boom".into(),
            tag: None,
        };
        let rec = n.normalize(&ev).unwrap();
        assert_eq!(rec.polarity, 0.0);
    });

    let app = polarity_stream::metrics::router(handle);
    let rsp = app
        .clone()
        .oneshot(Request::get("/metrics").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("buffer_records 1"), "{text}");
    assert!(text.contains("scoring_failures_total 1"), "{text}");

    let health = app
        .oneshot(Request::get("/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}
