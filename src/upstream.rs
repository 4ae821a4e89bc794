//! Upstream adapter (C2): translates the Flagr-compatible wire shape into
//! the flag model and performs remote evaluation calls with retry.
//!
//! Retry/backoff shape is grounded on the teacher crate's RPC resolver
//! (`resolver::rpc::RpcResolver::new`'s connection-retry loop): exponential
//! backoff doubling each attempt, capped, bounded by a maximum attempt
//! count. Here it guards individual HTTP calls rather than connection
//! establishment, and only retries 5xx/429 — a 4xx is never retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::FlagrOptions;
use crate::error::{FlagrError, Result};
use crate::model::{EvaluationContext, EvaluationResult, Flag};

#[derive(Debug, Deserialize)]
struct FlagSummary {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct EvaluationResponse {
    #[serde(rename = "flagID")]
    flag_id: i64,
    #[serde(rename = "flagKey")]
    flag_key: String,
    #[serde(rename = "segmentID")]
    segment_id: Option<i64>,
    #[serde(rename = "variantID")]
    variant_id: Option<i64>,
    #[serde(rename = "variantKey")]
    variant_key: Option<String>,
    #[serde(rename = "variantAttachment", default)]
    variant_attachment: std::collections::HashMap<String, serde_json::Value>,
    #[serde(rename = "evalDebugLog")]
    eval_debug_log: Option<EvalDebugLog>,
}

#[derive(Debug, Deserialize)]
struct EvalDebugLog {
    #[serde(default)]
    msg: String,
}

/// The contract C2 exposes to the rest of the crate. A trait so tests (and
/// future transports) can swap the HTTP implementation for a mock.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn health(&self) -> Result<()>;
    async fn list_flags(&self) -> Result<Vec<Flag>>;
    async fn get_flag(&self, id: i64) -> Result<Flag>;
    async fn evaluate(&self, flag_key: &str, ctx: &EvaluationContext) -> Result<EvaluationResult>;
}

/// Real HTTP implementation of [`Upstream`] against a Flagr-compatible
/// service, per the wire contract in the design's external-interfaces
/// section: `GET /flags`, `GET /flags/{id}`, `POST /evaluation`, `GET
/// /health`.
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry_attempts: u32,
}

impl HttpUpstream {
    pub fn new(options: &FlagrOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.http_timeout)
            .build()
            .map_err(FlagrError::Network)?;
        Ok(Self {
            client,
            base_url: options.endpoint.trim_end_matches('/').to_string(),
            api_key: options.api_key.clone(),
            retry_attempts: options.retry_attempts,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Exponential backoff on 5xx/429, no retry on any other 4xx. Doubles
    /// the delay each attempt starting at 100ms, capped at 5s.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        path: &str,
    ) -> Result<reqwest::Response> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;

        loop {
            let response = self.authed(build()).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    attempt += 1;
                    if !retryable || attempt >= self.retry_attempts {
                        return Err(FlagrError::UpstreamHttp {
                            status: status.as_u16(),
                            path: path.to_string(),
                        });
                    }
                    warn!(
                        path,
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        "upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry_attempts {
                        return Err(FlagrError::Network(err));
                    }
                    warn!(path, attempt, error = %err, "upstream call failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self))]
    async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        self.send_with_retry(|| self.client.get(&url), "/health").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_flags(&self) -> Result<Vec<Flag>> {
        let url = format!("{}/flags", self.base_url);
        let response = self.send_with_retry(|| self.client.get(&url), "/flags").await?;
        let summaries: Vec<FlagSummary> = response.json().await.map_err(FlagrError::Network)?;
        debug!(count = summaries.len(), "listed upstream flags");

        let mut flags = Vec::with_capacity(summaries.len());
        for summary in summaries {
            flags.push(self.get_flag(summary.id).await?);
        }
        Ok(flags)
    }

    #[instrument(skip(self))]
    async fn get_flag(&self, id: i64) -> Result<Flag> {
        let url = format!("{}/flags/{}", self.base_url, id);
        let path = format!("/flags/{}", id);
        let response = match self.send_with_retry(|| self.client.get(&url), &path).await {
            Ok(response) => response,
            Err(FlagrError::UpstreamHttp { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(FlagrError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err),
        };
        response.json().await.map_err(FlagrError::Network)
    }

    #[instrument(skip(self, ctx))]
    async fn evaluate(&self, flag_key: &str, ctx: &EvaluationContext) -> Result<EvaluationResult> {
        let url = format!("{}/evaluation", self.base_url);
        let body = serde_json::json!({
            "flagKey": flag_key,
            "entityID": ctx.entity_id,
            "entityType": ctx.entity_type_or_default(),
            "entityContext": ctx
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or_default()))
                .collect::<std::collections::HashMap<_, _>>(),
        });

        let response = self
            .send_with_retry(|| self.client.post(&url).json(&body), "/evaluation")
            .await?;
        let parsed: EvaluationResponse = response.json().await.map_err(FlagrError::Network)?;

        Ok(EvaluationResult {
            flag_id: parsed.flag_id,
            flag_key: parsed.flag_key,
            segment_id: parsed.segment_id,
            variant_id: parsed.variant_id,
            variant_key: parsed.variant_key,
            variant_attachment: parsed.variant_attachment,
            evaluated_locally: false,
            evaluation_time: Duration::ZERO,
            reason: parsed
                .eval_debug_log
                .map(|log| log.msg)
                .unwrap_or_else(|| "remote evaluation".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options_for(endpoint: String) -> FlagrOptions {
        let mut options = FlagrOptions::default();
        options.endpoint = endpoint;
        options.retry_attempts = 3;
        options
    }

    #[tokio::test]
    async fn get_flag_not_found_maps_to_not_found_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(&options_for(server.uri())).unwrap();
        let result = upstream.get_flag(7).await;
        assert!(matches!(result, Err(FlagrError::NotFound(_))));
    }

    #[tokio::test]
    async fn retries_on_500_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(&options_for(server.uri())).unwrap();
        assert!(upstream.health().await.is_ok());
    }

    #[tokio::test]
    async fn does_not_retry_on_4xx_other_than_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags/1"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(&options_for(server.uri())).unwrap();
        assert!(upstream.get_flag(1).await.is_err());
    }
}
