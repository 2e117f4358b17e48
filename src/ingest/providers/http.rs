use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use crate::error::StreamError;
use crate::ingest::types::{EventSource, Subscription};

const USER_AGENT: &str = concat!("polarity-stream/", env!("CARGO_PKG_VERSION"));

/// Longest accepted line; a stream that never sends a newline is torn down.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Long-lived HTTP subscription delivering one JSON event per line.
/// Blank lines are keep-alives and are passed through for the caller to skip.
pub struct HttpStreamSource {
    url: String,
    bearer_token: String,
    client: Client,
    max_line_bytes: usize,
}

impl HttpStreamSource {
    pub fn new(url: impl Into<String>, bearer_token: impl Into<String>) -> Result<Self> {
        // No total timeout: the response body is the stream. A silent
        // connection (no keep-alive for 90s) surfaces as a read error.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(90))
            .build()
            .context("building stream http client")?;
        Ok(Self {
            url: url.into(),
            bearer_token: bearer_token.into(),
            client,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }
}

#[async_trait]
impl EventSource for HttpStreamSource {
    async fn connect(&self, track: &[String]) -> Result<Box<dyn Subscription>, StreamError> {
        let mut req = self.client.get(&self.url).bearer_auth(&self.bearer_token);
        if !track.is_empty() {
            req = req.query(&[("track", track.join(","))]);
        }
        let rsp = req
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        match rsp.status() {
            s if s.is_success() => Ok(Box::new(HttpSubscription::new(rsp, self.max_line_bytes))),
            s @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(StreamError::Unauthorized(s.as_u16()))
            }
            s => Err(StreamError::Status(s.as_u16())),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct HttpSubscription {
    response: Response,
    pending: Vec<u8>,
    eof: bool,
    max_line_bytes: usize,
}

impl HttpSubscription {
    fn new(response: Response, max_line_bytes: usize) -> Self {
        Self {
            response,
            pending: Vec::new(),
            eof: false,
            max_line_bytes,
        }
    }

    fn too_long(&self) -> StreamError {
        StreamError::Read(format!(
            "line exceeds {} bytes without a terminator",
            self.max_line_bytes
        ))
    }
}

#[async_trait]
impl Subscription for HttpSubscription {
    async fn next_line(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                if pos > self.max_line_bytes {
                    return Err(self.too_long());
                }
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    self.pending.extend_from_slice(&bytes);
                    if self.pending.len() > self.max_line_bytes
                        && !self.pending.contains(&b'\n')
                    {
                        return Err(self.too_long());
                    }
                }
                Ok(None) => self.eof = true,
                Err(e) => return Err(StreamError::Read(e.to_string())),
            }
        }
    }
}
