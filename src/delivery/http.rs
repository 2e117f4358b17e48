use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::{Destination, IngestTransport};
use crate::error::DeliveryError;

const USER_AGENT: &str = concat!("polarity-stream/", env!("CARGO_PKG_VERSION"));

/// Multipart CSV upload over one pooled (keep-alive) HTTP client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("building ingestion http client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl IngestTransport for HttpTransport {
    async fn post_csv(&self, dest: &Destination, payload: &str) -> Result<(), DeliveryError> {
        let part = Part::text(payload.to_string())
            .file_name("csv")
            .mime_str("text/csv")
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let form = Form::new().part("csv", part);

        let rsp = self
            .client
            .post(dest.datasources_url())
            .query(&[("mode", "append"), ("name", dest.datasource.as_str())])
            .bearer_auth(&dest.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = rsp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = rsp.text().await.unwrap_or_default();
        Err(DeliveryError::from_status(status.as_u16(), body))
    }
}
