use std::io::Write;

use anyhow::{bail, Context, Result};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::ResultSink;
use crate::config::VictoriaMetricsConfig;

/// Influx line-protocol ingestion path.
const WRITE_PATH: &str = "/insert/0/influx/write";

/// Writes batches to VictoriaMetrics over HTTP.
///
/// Transport failures are retried immediately up to `max_retries` total
/// attempts, rebuilding the request from the retained body each time. A
/// response with any status other than 200 or 204 fails the batch without
/// retrying.
pub struct VictoriaMetricsSink {
    client: reqwest::Client,
    write_url: String,
    username: String,
    password: String,
    max_retries: u32,
    compression: String,
}

impl VictoriaMetricsSink {
    pub fn new(cfg: &VictoriaMetricsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            write_url: write_url(&cfg.address),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            max_retries: cfg.max_retries,
            compression: cfg.compression.clone(),
        })
    }

    async fn send(&self, body: Vec<u8>) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.write_url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
    }
}

impl ResultSink for VictoriaMetricsSink {
    async fn store(&self, records: Vec<String>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let raw = records.join("\n").into_bytes();
        let raw_len = raw.len();
        let body = compress(&raw, &self.compression).context("compressing request body")?;

        let attempts = self.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.send(body.clone()).await {
                Ok(resp) => {
                    let status = resp.status();
                    // Drain body for connection reuse.
                    let _ = resp.bytes().await;

                    if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
                        bail!("victoriametrics write returned unexpected status: {status}");
                    }

                    debug!(
                        records = records.len(),
                        bytes = raw_len,
                        attempt,
                        "wrote batch to victoriametrics",
                    );

                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "victoriametrics write failed, retrying");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("writing to victoriametrics failed after {attempts} attempts")
                    });
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn write_url(address: &str) -> String {
    format!("{}{WRITE_PATH}", address.trim_end_matches('/'))
}

// --- Compression ---

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
