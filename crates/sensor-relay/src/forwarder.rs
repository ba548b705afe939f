// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards normalized readings to the ingestion endpoint.
//!
//! A forwarder makes exactly one request per call. Retrying is the pipeline's
//! job, driven by the attempt counter carried in the delivery metadata.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::codec::{self, Reading};
use crate::errors::TransientFailure;

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Sends `reading` to the sink, giving up after `timeout`.
    async fn forward(&self, reading: &Reading, timeout: Duration) -> Result<(), TransientFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    url: String,
}

impl HttpForwarder {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, reading: &Reading, timeout: Duration) -> Result<(), TransientFailure> {
        let body = codec::encode(reading)?;

        let time = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransientFailure::Timeout(timeout)
                } else {
                    TransientFailure::Network(e.to_string())
                }
            })?;
        let elapsed = time.elapsed();

        let status = response.status();
        if status.is_success() {
            debug!(
                "Forwarder | {status} from {} in {} ms",
                self.url,
                elapsed.as_millis()
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransientFailure::Status { status, body })
    }
}
