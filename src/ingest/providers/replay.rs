use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StreamError;
use crate::ingest::types::{EventSource, Subscription};

/// Replays a JSONL capture as if it were the live stream. After the last
/// line the subscription stays open and silent, like a quiet stream.
pub struct ReplaySource {
    path: PathBuf,
    pace: Option<Duration>,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pace: None,
        }
    }

    /// Sleep between lines to mimic live traffic.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl EventSource for ReplaySource {
    async fn connect(&self, _track: &[String]) -> Result<Box<dyn Subscription>, StreamError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StreamError::Connect(format!("{}: {e}", self.path.display())))?;
        let lines = content.lines().map(str::to_string).collect();
        Ok(Box::new(ReplaySubscription {
            lines,
            pace: self.pace,
        }))
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

struct ReplaySubscription {
    lines: VecDeque<String>,
    pace: Option<Duration>,
}

#[async_trait]
impl Subscription for ReplaySubscription {
    async fn next_line(&mut self) -> Result<Option<String>, StreamError> {
        let Some(line) = self.lines.pop_front() else {
            std::future::pending::<()>().await;
            return Ok(None);
        };
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("capture.jsonl");
        std::fs::write(&p, "a\nb\n").unwrap();

        let src = ReplaySource::new(&p);
        let mut sub = src.connect(&[]).await.unwrap();
        assert_eq!(sub.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(sub.next_line().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn pace_spaces_out_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("capture.jsonl");
        std::fs::write(&p, "a\nb\n").unwrap();

        let src = ReplaySource::new(&p).with_pace(Duration::from_secs(2));
        let mut sub = src.connect(&[]).await.unwrap();
        let start = tokio::time::Instant::now();
        sub.next_line().await.unwrap();
        sub.next_line().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(4) && waited < Duration::from_millis(4_010));
    }

    #[tokio::test]
    async fn missing_file_is_a_connect_error() {
        let src = ReplaySource::new("definitely/not/here.jsonl");
        assert!(matches!(src.connect(&[]).await, Err(StreamError::Connect(_))));
    }
}
