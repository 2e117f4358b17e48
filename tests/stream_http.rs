// tests/stream_http.rs
use std::collections::HashMap;

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use polarity_stream::error::StreamError;
use polarity_stream::ingest::providers::HttpStreamSource;
use polarity_stream::ingest::EventSource;

async fn stream(
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != "Bearer good" {
        return (StatusCode::UNAUTHORIZED, String::new());
    }
    let track = q.get("track").cloned().unwrap_or_default();
    (
        StatusCode::OK,
        format!("{{\"track\":\"{track}\"}}\r\n\r\nsecond\nno-terminator"),
    )
}

async fn spawn_stream() -> String {
    let app = Router::new()
        .route("/stream", get(stream))
        .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/runaway", get(|| async { "x".repeat(4096) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn splits_body_into_lines_until_close() {
    let base = spawn_stream().await;
    let src = HttpStreamSource::new(format!("{base}/stream"), "good").unwrap();
    let track = vec!["covid".to_string(), "flu".to_string()];
    let mut sub = src.connect(&track).await.unwrap();

    let mut lines = Vec::new();
    while let Some(line) = sub.next_line().await.unwrap() {
        lines.push(line.trim().to_string());
    }
    assert_eq!(
        lines,
        vec![
            r#"{"track":"covid,flu"}"#.to_string(),
            String::new(),
            "second".into(),
            "no-terminator".into(),
        ]
    );
}

#[tokio::test]
async fn bad_credentials_are_reported() {
    let base = spawn_stream().await;
    let src = HttpStreamSource::new(format!("{base}/stream"), "bad").unwrap();
    let err = src.connect(&["covid".to_string()]).await.err().unwrap();
    assert!(matches!(err, StreamError::Unauthorized(401)));
}

#[tokio::test]
async fn other_statuses_are_connect_failures() {
    let base = spawn_stream().await;
    let src = HttpStreamSource::new(format!("{base}/down"), "good").unwrap();
    let err = src.connect(&[]).await.err().unwrap();
    assert!(matches!(err, StreamError::Status(503)));
}

#[tokio::test]
async fn unterminated_line_is_a_read_error() {
    let base = spawn_stream().await;
    let src = HttpStreamSource::new(format!("{base}/runaway"), "good")
        .unwrap()
        .with_max_line_bytes(256);
    let mut sub = src.connect(&[]).await.unwrap();
    let err = sub.next_line().await.err().unwrap();
    assert!(matches!(err, StreamError::Read(_)), "{err}");
}
