//! Harvester-side transport to the ingestion server.
//!
//! [`ReportSink`] is the seam between the harvester loop and the server:
//! [`ServerClient`] implements it over HTTP, and tests implement it over an
//! in-process store.
//!
//! Report delivery is never retried here; a failed report surfaces as an
//! error and the file is picked up again on a later cycle. Only
//! registration retries transport failures, with a fixed delay.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use cycler_harvest_core::wire::{
    HarvesterConfig, RegisterRequest, RegisterResponse, Report, ReportResponse,
};

use crate::config::HarvesterSettings;
use crate::server::AUTH_SCHEME;

/// Where a harvester sends its reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Configuration for the next cycle.
    async fn fetch_config(&self) -> Result<HarvesterConfig>;

    /// Deliver one report and wait for the server's answer.
    async fn send(&self, report: &Report) -> Result<ReportResponse>;
}

/// A structured error answer from the server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("server rejected request ({status} {code}): {message}")]
pub struct ServerRejection {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

async fn rejection(response: reqwest::Response) -> ServerRejection {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => ServerRejection {
            status,
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Err(_) => ServerRejection {
            status,
            code: "unknown".to_string(),
            message: text,
        },
    }
}

/// HTTP client bound to one registered harvester.
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    harvester_id: i64,
    auth_header: String,
}

impl ServerClient {
    pub fn new(settings: &HarvesterSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            harvester_id: settings.harvester_id,
            auth_header: format!("{} {}", AUTH_SCHEME, settings.api_key),
        })
    }

    /// Register a new harvester called `name`.
    ///
    /// Transport failures and 5xx answers are retried up to `retries` times,
    /// `retry_delay` apart. A 4xx answer fails immediately.
    pub async fn register(
        server_url: &str,
        name: &str,
        retries: u32,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<RegisterResponse> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!("{}/harvesters", server_url.trim_end_matches('/'));
        let body = RegisterRequest {
            name: name.to_string(),
        };

        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                log::warn!(
                    "registration attempt {} failed, retrying in {:?}",
                    attempt,
                    retry_delay
                );
                tokio::time::sleep(retry_delay).await;
            }

            match http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json()
                        .await
                        .context("Invalid registration response");
                }
                Ok(response) if response.status().is_server_error() => {
                    last_err = Some(rejection(response).await.into());
                }
                Ok(response) => bail!(rejection(response).await),
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Registration failed after retries")))
    }
}

#[async_trait]
impl ReportSink for ServerClient {
    async fn fetch_config(&self) -> Result<HarvesterConfig> {
        let url = format!("{}/harvesters/{}/config", self.base_url, self.harvester_id);
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        if !response.status().is_success() {
            bail!(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    async fn send(&self, report: &Report) -> Result<ReportResponse> {
        let url = format!("{}/harvesters/{}/report", self.base_url, self.harvester_id);
        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.auth_header)
            .json(report)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        if !response.status().is_success() {
            bail!(rejection(response).await);
        }
        Ok(response.json().await?)
    }
}
